#![no_main]

use execgate::command::quote::{format_argv, parse_argv};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|argv: Vec<String>| {
    if argv.is_empty() || argv.iter().any(|t| t.contains('\0')) {
        return;
    }
    let rendered = format_argv(&argv);
    let parsed = parse_argv(&rendered).expect("rendering always parses");
    assert_eq!(parsed, argv);
});
