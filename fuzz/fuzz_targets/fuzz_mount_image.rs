#![no_main]
use libfuzzer_sys::fuzz_target;
use nvmfs::nvm::{Geometry, RamDevice};
use nvmfs::{Filesystem, OpenFlags};

// Mounting arbitrary bytes may fail but must never panic
fuzz_target!(|input: &[u8]| {
    let geometry = Geometry::new(64, 4, 8);
    let mut device = RamDevice::new(geometry);

    // Start from a valid image and overlay the fuzz input on it
    if let Ok(fs) = Filesystem::format(device.clone()) {
        if let Ok(mut file) = fs.open("seed", OpenFlags::CREATE | OpenFlags::WRITE) {
            let _ = file.write(b"seed data spanning a page or two of payload");
        }
        if let Ok(formatted) = fs.unmount() {
            device = formatted;
        }
    }

    let image = device.as_bytes_mut();
    for (i, chunk) in input.chunks(3).enumerate() {
        if chunk.len() == 3 {
            let addr = u16::from_le_bytes([chunk[0], chunk[1]]) as usize % image.len();
            image[addr] = chunk[2];
        } else if i == 0 {
            return;
        }
    }

    if let Ok(fs) = Filesystem::mount(device) {
        for object in fs.list() {
            if let Ok(mut file) = fs.open(&object.name, OpenFlags::READ) {
                let mut buf = Vec::new();
                let _ = file.read_to_end(&mut buf);
            }
        }
        let _ = fs.collect_garbage();
    }
});
