#![no_main]

use execgate::command::shell::parse_shell;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let analysis = parse_shell(data);
    // ok implies at least one segment
    if analysis.ok {
        assert!(!analysis.segments.is_empty());
    }
});
