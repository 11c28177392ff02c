#![no_main]

use libfuzzer_sys::fuzz_target;

use fetchpipe::headers::cache_status::CacheStatus;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(parsed) = CacheStatus::parse(value) {
        // A parsed member always renders to something parseable again.
        let rendered = parsed.to_string();
        let reparsed = CacheStatus::parse(&rendered).expect("rendered member must parse");
        assert_eq!(reparsed.hit, parsed.hit);
        assert_eq!(reparsed.fwd, parsed.fwd);
        assert_eq!(reparsed.ttl, parsed.ttl);
    }
});
