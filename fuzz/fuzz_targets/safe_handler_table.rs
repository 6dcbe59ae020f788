#![no_main]

use libfuzzer_sys::fuzz_target;
use sehveh::filter::ModuleImage;

fuzz_target!(|data: &[u8]| {
    let image = ModuleImage::new(0x0040_0000, data);
    if let Ok(Some(table)) = image.safe_handler_table() {
        for rva in table.iter() {
            let _ = table.contains(rva);
        }
    }
});
