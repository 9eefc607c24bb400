#![no_main]

use libfuzzer_sys::fuzz_target;
use sweep_discord_runtime::{parse_sweep_command, parse_user_reference, SweepCommand};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);

    if let Some(user) = parse_user_reference(&raw) {
        assert!(user.get() > 0);
    }

    match parse_sweep_command(&raw, "!") {
        Some(SweepCommand::Delete { author, start_from }) => {
            assert!(raw.trim_start().starts_with("!d"));
            assert!(author.get() > 0);
            if let Some(start_from) = start_from {
                assert!(raw.contains(&start_from.to_string()));
            }
        }
        Some(SweepCommand::Invalid { message }) => {
            assert!(message.starts_with("Usage: !"));
        }
        Some(SweepCommand::Cancel | SweepCommand::Status | SweepCommand::Help) => {
            assert!(raw.trim_start().starts_with('!'));
        }
        None => {}
    }
});
