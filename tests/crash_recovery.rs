//! Power-loss and program-failure recovery
//!
//! A `ScriptedDevice` cuts the power after a chosen number of programs or
//! erases. The device is then handed to a fresh mount, which must see
//! either the old or the new content of every object, never a mix.

use nvmfs::nvm::{FaultScript, Geometry, Op, RamDevice, Scripted, ScriptedDevice};
use nvmfs::{DeviceError, Filesystem, FsError, NvmDevice, OpenFlags, Whence};

type ScriptedFs = Filesystem<ScriptedDevice<RamDevice>>;

fn geometry() -> Geometry {
    // 108-byte payloads
    Geometry::new(128, 8, 16)
}

fn payload() -> usize {
    108
}

fn scripted_fs(script: &FaultScript) -> ScriptedFs {
    let device = ScriptedDevice::new(RamDevice::new(geometry()), script.clone());
    Filesystem::format(device).unwrap()
}

/// Pull the plug and mount the raw flash contents again
fn power_cycle(fs: ScriptedFs) -> Filesystem<RamDevice> {
    let device = fs.into_device().unwrap().into_inner();
    Filesystem::mount(device).unwrap()
}

fn put<D: NvmDevice>(fs: &Filesystem<D>, name: &str, data: &[u8]) {
    let mut file = fs
        .open(name, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
        .unwrap();
    file.write(data).unwrap();
    file.close().unwrap();
}

fn get<D: NvmDevice>(fs: &Filesystem<D>, name: &str) -> Vec<u8> {
    let mut file = fs.open(name, OpenFlags::READ).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    out
}

/// Overwrite `name` in place with the power budget already set
fn overwrite(fs: &ScriptedFs, name: &str, data: &[u8]) -> nvmfs::Result<usize> {
    let mut file = fs.open(name, OpenFlags::WRITE)?;
    file.seek(0, Whence::Set)?;
    file.write(data)
}

#[test]
fn test_interrupted_commit_rolls_back() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"old");

    // Page program lands, the slot erase does not
    script.cut_power_after(1);
    let result = overwrite(&fs, "a", b"new!");
    assert!(matches!(result, Err(FsError::Device(_))));

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "a"), b"old");
    assert_eq!(fs.stats().pending_pages, 0);
}

#[test]
fn test_torn_metadata_body_keeps_previous_image() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"old");

    // Inactive slot erased, body write lost
    script.cut_power_after(2);
    assert!(overwrite(&fs, "a", b"new!").is_err());

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "a"), b"old");
}

#[test]
fn test_committed_write_rolls_forward() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"old");

    // Program + erase + body + header land, the promotion does not
    script.cut_power_after(4);
    assert_eq!(overwrite(&fs, "a", b"new!").unwrap(), 4);
    assert_eq!(get(&fs, "a"), b"new!");

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "a"), b"new!");

    let stats = fs.stats();
    assert_eq!(stats.pending_pages, 0);
    assert_eq!(stats.used_pages, 1);
}

#[test]
fn test_every_cut_point_is_atomic() {
    let old = vec![b'A'; payload() * 3];
    let new = vec![b'B'; payload() * 3];

    // 3 programs, 3 metadata ops, 3 promotions, 3 releases
    for cut in 0..14 {
        let script = FaultScript::new();
        let fs = scripted_fs(&script);
        put(&fs, "obj", &old);
        put(&fs, "other", b"bystander");

        script.cut_power_after(cut);
        let result = overwrite(&fs, "obj", &new);

        let fs = power_cycle(fs);
        let content = get(&fs, "obj");
        match result {
            Ok(_) => assert_eq!(content, new, "cut after {} ops", cut),
            Err(_) => assert_eq!(content, old, "cut after {} ops", cut),
        }
        assert_eq!(get(&fs, "other"), b"bystander");
        assert_eq!(fs.stats().pending_pages, 0);
    }
}

#[test]
fn test_interrupted_create_leaves_no_object() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);

    script.cut_power_after(1);
    let result = fs.open("new", OpenFlags::CREATE | OpenFlags::WRITE);
    assert!(matches!(result, Err(FsError::Device(_))));
    assert!(!fs.exists("new"));

    let fs = power_cycle(fs);
    assert!(!fs.exists("new"));
}

#[test]
fn test_interrupted_remove_keeps_object() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "keep", b"still here");

    // Slot erase lands, the header write does not
    script.cut_power_after(1);
    assert!(fs.remove("keep").is_err());
    assert!(fs.exists("keep"));

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "keep"), b"still here");
}

#[test]
fn test_failed_program_retires_page() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    let mut file = fs
        .open("a", OpenFlags::CREATE | OpenFlags::READ_WRITE)
        .unwrap();

    // Fail the next page program only
    script.push(Op::Write, Scripted::Fail(-5));
    let err = file.write(b"first").unwrap_err();
    assert_eq!(err.errno(), -5);
    assert_eq!(fs.stats().bad_pages, 1);
    assert_eq!(file.size().unwrap(), 0);

    // The retry lands on another page
    file.write(b"second").unwrap();
    file.close().unwrap();
    assert_eq!(get(&fs, "a"), b"second");
    assert_eq!(fs.stats().bad_pages, 1);

    // The bad mark made it to flash
    let fs = power_cycle(fs);
    assert_eq!(fs.stats().bad_pages, 1);
    assert_eq!(get(&fs, "a"), b"second");
}

#[test]
fn test_bad_page_never_reused() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"seed");

    script.push(Op::Write, Scripted::Fail(-5));
    assert!(overwrite(&fs, "a", b"fails").is_err());

    // Cycle through the whole device a few times
    for round in 0..200u32 {
        let data = round.to_le_bytes().repeat(20);
        overwrite(&fs, "a", &data).unwrap();
        assert_eq!(get(&fs, "a"), data);
    }

    let stats = fs.stats();
    assert_eq!(stats.bad_pages, 1);
    assert!(stats.total_erases > 0);
}

#[test]
fn test_gc_interrupted_by_power_loss() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);

    // Fill the first data block, then make half of it stale
    let data: Vec<u8> = (0..payload() * 8).map(|i| (i % 251) as u8).collect();
    put(&fs, "a", &data);
    let mut file = fs.open("a", OpenFlags::WRITE).unwrap();
    file.write(&vec![7u8; payload() * 4]).unwrap();
    file.close().unwrap();

    let mut expected = data.clone();
    expected[..payload() * 4].fill(7);

    // First relocation copy lands, its promotion does not
    script.cut_power_after(1);
    assert!(fs.collect_garbage().is_err());
    assert_eq!(get(&fs, "a"), expected);

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "a"), expected);

    let report = fs.collect_garbage().unwrap();
    assert!(!report.is_empty());
    assert_eq!(get(&fs, "a"), expected);
}

#[test]
fn test_unmount_with_power_cut_still_mounts() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"before");

    // Commit lands, promotion and the retry at unmount both fail
    script.cut_power_after(4);
    overwrite(&fs, "a", b"after!").unwrap();

    let device = fs.unmount().unwrap().into_inner();
    let fs = Filesystem::mount(device).unwrap();
    assert_eq!(get(&fs, "a"), b"after!");
    assert_eq!(fs.stats().pending_pages, 0);
}

#[test]
fn test_device_hook_errors_propagate() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"x");
    let device = fs.unmount().unwrap();

    script.push(Op::Mount, Scripted::Fail(-5));
    let err = Filesystem::mount(device).err().unwrap();
    assert!(matches!(err, FsError::Device(_)));
    assert_eq!(err.errno(), -5);

    let device = ScriptedDevice::new(RamDevice::new(geometry()), script.clone());
    script.push(Op::Format, Scripted::Fail(-5));
    let err = Filesystem::format(device).err().unwrap();
    assert_eq!(err.errno(), -5);

    let device = ScriptedDevice::new(RamDevice::new(geometry()), script.clone());
    script.push(Op::Init, Scripted::Fail(-19));
    let err = Filesystem::format(device).err().unwrap();
    assert_eq!(err.errno(), -19);
}

#[test]
fn test_failed_gc_erase_retires_block() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);

    // First data block full, half of it superseded
    let data: Vec<u8> = (0..payload() * 8).map(|i| (i % 13) as u8).collect();
    put(&fs, "a", &data);
    overwrite(&fs, "a", &vec![9u8; payload() * 4]).unwrap();
    let mut expected = data.clone();
    expected[..payload() * 4].fill(9);

    script.push(Op::Erase, Scripted::Fail(-5));
    let report = fs.collect_garbage().unwrap();
    assert_eq!(report.victims, vec![2]);
    assert_eq!(report.relocated, 4);
    assert_eq!(report.reclaimed, 0);
    assert_eq!(fs.stats().bad_pages, geometry().pages_per_block as usize);
    assert_eq!(get(&fs, "a"), expected);

    let fs = power_cycle(fs);
    assert_eq!(get(&fs, "a"), expected);
    assert_eq!(fs.stats().pending_pages, 0);
}

#[test]
fn test_short_read_fails_mount() {
    let script = FaultScript::new();
    let fs = scripted_fs(&script);
    put(&fs, "a", b"x");
    let device = fs.unmount().unwrap();

    // Slot header read comes back four bytes long
    script.push(Op::Read, Scripted::Data(vec![0xFF; 4]));
    let err = Filesystem::mount(device).err().unwrap();
    assert!(matches!(
        err,
        FsError::Device(DeviceError::ShortRead { got: 4, .. })
    ));
}
