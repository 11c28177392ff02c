#![no_main]

use libfuzzer_sys::fuzz_target;

use fetchpipe::headers::cache_control::CacheControl;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = std::str::from_utf8(data) else {
        return;
    };
    let parsed = CacheControl::parse_value(value);

    // Whatever parsed must survive a format and reparse round trip.
    if let Some(rendered) = parsed.to_header_value()
        && let Ok(rendered) = rendered.to_str()
    {
        assert_eq!(CacheControl::parse_value(rendered), parsed);
    }
});
