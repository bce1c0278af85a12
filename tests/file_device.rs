//! File-backed images: persistence across process-style reopen

use nvmfs::nvm::{FileDevice, Geometry};
use nvmfs::{Filesystem, FsBuilder, FsError, OpenFlags, Whence};
use tempfile::TempDir;

fn geometry() -> Geometry {
    Geometry::new(256, 8, 32)
}

#[test]
fn test_image_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flash.img");

    {
        let fs = Filesystem::format(FileDevice::create(&path, geometry()).unwrap()).unwrap();
        let mut file = fs
            .open("fs/story.txt", OpenFlags::CREATE | OpenFlags::WRITE)
            .unwrap();
        file.write(b"The big bad wolf").unwrap();
        file.close().unwrap();
        let mut device = fs.unmount().unwrap();
        device.sync().unwrap();
    }

    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        geometry().capacity()
    );

    let fs = Filesystem::mount(FileDevice::open(&path, geometry()).unwrap()).unwrap();
    let mut file = fs.open("fs/story.txt", OpenFlags::READ).unwrap();
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).unwrap();
    assert_eq!(buf, b"The big bad wolf");
}

#[test]
fn test_counter_persists_across_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counter.img");
    let builder = FsBuilder::new().geometry(geometry());

    for expected in 0..5u32 {
        let fs = builder.clone().mount_or_format_file(&path).unwrap();
        let mut file = match fs.open("fs/counter.txt", OpenFlags::READ_WRITE) {
            Ok(file) => file,
            Err(FsError::NotFound(_)) => {
                let mut file = fs
                    .open(
                        "fs/counter.txt",
                        OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::READ_WRITE,
                    )
                    .unwrap();
                file.write(b"0\0").unwrap();
                file.seek(0, Whence::Set).unwrap();
                file
            }
            Err(err) => panic!("unexpected error {}", err),
        };

        let mut raw = Vec::new();
        file.read_to_end(&mut raw).unwrap();
        let text = String::from_utf8(raw).unwrap();
        let value: u32 = text.trim_end_matches('\0').parse().unwrap();
        assert_eq!(value, expected);

        file.seek(0, Whence::Set).unwrap();
        file.write(format!("{}\0", value + 1).as_bytes()).unwrap();
    }
}

#[test]
fn test_wrong_size_image_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.img");
    std::fs::write(&path, vec![0xFFu8; 1024]).unwrap();

    assert!(matches!(
        FileDevice::open(&path, geometry()),
        Err(FsError::Config(_))
    ));
}

#[test]
fn test_missing_image_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = FileDevice::open(dir.path().join("absent.img"), geometry());
    assert!(matches!(result, Err(FsError::Io(_))));
}

#[test]
fn test_erased_image_is_not_formatted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blank.img");
    let device = FileDevice::create(&path, geometry()).unwrap();
    assert!(matches!(
        Filesystem::mount(device),
        Err(FsError::NotFormatted)
    ));
}
