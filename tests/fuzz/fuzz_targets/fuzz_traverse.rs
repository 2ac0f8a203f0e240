#![no_main]
use libfuzzer_sys::fuzz_target;

use covcmp::traverse::Traverser;

fuzz_target!(|data: &[u8]| {
    // The traverser must terminate and never panic, whatever the hunk
    // headers claim about line ranges.
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(diff) = covcmp::diff::parse_diff(s) else {
        return;
    };
    let src: Vec<String> = (0..64).map(|i| format!("line {i}")).collect();
    for file in diff.files.values() {
        for _ in Traverser::new(32, 48, file.segments.clone(), src.clone()) {}
    }
});
