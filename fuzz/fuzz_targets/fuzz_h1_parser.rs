#![no_main]

use libfuzzer_sys::fuzz_target;
use lyn::h1::parse;

fuzz_target!(|data: &[u8]| {
    let _ = parse(data);
});
