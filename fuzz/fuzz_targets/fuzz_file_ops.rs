#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use nvmfs::nvm::{Geometry, RamDevice};
use nvmfs::{Filesystem, OpenFlags, Whence};

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { name_idx: u8, offset: u16, data: Vec<u8> },
    Read { name_idx: u8, offset: u16, len: u8 },
    Truncate { name_idx: u8, size: u16 },
    Remove { name_idx: u8 },
    Collect,
    Remount,
}

// Random operation streams must never panic, and remounting must always
// reproduce the sizes seen before it
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<FileOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut fs = match Filesystem::format(RamDevice::new(Geometry::new(64, 4, 16))) {
        Ok(fs) => fs,
        Err(_) => return,
    };

    for op in ops.into_iter().take(64) {
        match op {
            FileOp::Write { name_idx, offset, data } => {
                let name = format!("f{}", name_idx % 4);
                if let Ok(mut file) = fs.open(&name, OpenFlags::CREATE | OpenFlags::WRITE) {
                    if file.seek(offset as i64 % 512, Whence::Set).is_ok() {
                        let _ = file.write(&data);
                    }
                }
            }
            FileOp::Read { name_idx, offset, len } => {
                let name = format!("f{}", name_idx % 4);
                if let Ok(mut file) = fs.open(&name, OpenFlags::READ) {
                    let mut buf = vec![0u8; len as usize];
                    if file.seek(offset as i64, Whence::Set).is_ok() {
                        let _ = file.read(&mut buf);
                    }
                }
            }
            FileOp::Truncate { name_idx, size } => {
                let name = format!("f{}", name_idx % 4);
                if let Ok(mut file) = fs.open(&name, OpenFlags::WRITE) {
                    let _ = file.truncate(size as u64 % 512);
                }
            }
            FileOp::Remove { name_idx } => {
                let _ = fs.remove(&format!("f{}", name_idx % 4));
            }
            FileOp::Collect => {
                let _ = fs.collect_garbage();
            }
            FileOp::Remount => {
                let before: Vec<_> = fs.list().into_iter().map(|o| (o.name, o.size)).collect();
                let device = match fs.unmount() {
                    Ok(device) => device,
                    Err(_) => return,
                };
                fs = Filesystem::mount(device).expect("remount after clean unmount");
                let after: Vec<_> = fs.list().into_iter().map(|o| (o.name, o.size)).collect();
                assert_eq!(before, after);
            }
        }
    }
});
