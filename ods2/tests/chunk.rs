mod common;

use block_dev::{BlockDevice, BLOCK_SIZE};
use common::*;
use ods2::{Error, FileId, MountFlag, Session};

#[test]
fn blocks_past_highwater_read_as_zero() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (_, fcb) = new_file(&mut session, volume, "SPARSE.DAT;1", 4);
    // 磁盘上残留的旧数据不应被读到
    for vbn in 1..=4 {
        let m = session.get_window(fcb, vbn).unwrap();
        disk.write_blocks(u64::from(m.lbn.get()), &[0xEE; BLOCK_SIZE])
            .unwrap();
    }

    let mut buf = [0xAAu8; BLOCK_SIZE];
    session.read_block(fcb, 1, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    session.write_block(fcb, 1, &pattern_block(1)).unwrap();
    assert_eq!(session.file_info(fcb).unwrap().highwater, 2);
    session.read_block(fcb, 1, &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern_block(1)[..]);
    session.read_block(fcb, 2, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));

    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn access_outside_file() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (_, fcb) = new_file(&mut session, volume, "SHORT.DAT;1", 3);
    assert!(matches!(session.access_chunk(fcb, 0, 0), Err(Error::EndOfFile)));
    assert!(matches!(session.access_chunk(fcb, 4, 0), Err(Error::EndOfFile)));

    // 末尾块组只有 3 块
    let cref = session.access_chunk(fcb, 2, 0).unwrap();
    assert_eq!(cref.blocks, 2);
    assert_eq!(session.chunk_data(&cref).unwrap().len(), 2 * BLOCK_SIZE);
    session.deaccess_chunk(cref.chunk, 0, true).unwrap();

    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn modify_mask_must_be_granted() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (_, fcb) = new_file(&mut session, volume, "MASK.DAT;1", 4);
    let cref = session.access_chunk(fcb, 2, 1).unwrap();
    assert_eq!(cref.modmask, 0b0010);
    assert!(matches!(
        session.deaccess_chunk(cref.chunk, 0b0110, true),
        Err(Error::WriteLocked)
    ));
    session.chunk_data_mut(&cref).unwrap()[..4].copy_from_slice(b"DATA");
    session
        .deaccess_chunk(cref.chunk, cref.modmask, true)
        .unwrap();

    let read = session.access_chunk(fcb, 1, 0).unwrap();
    assert_eq!(read.modmask, 0);
    assert!(matches!(
        session.chunk_data_mut(&read),
        Err(Error::WriteLocked)
    ));
    assert_eq!(&session.chunk_data(&read).unwrap()[BLOCK_SIZE..BLOCK_SIZE + 4], b"DATA");
    session.deaccess_chunk(read.chunk, 0, true).unwrap();

    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn evicted_chunks_are_written_back() {
    let disk = fresh_disk(2048);
    let mut session = Session::new(ods2::MemOpener::new().with_disk(DISK, disk.clone()))
        .with_chunk_limit(2);
    let volume = mount_rw(&mut session);

    let (fid, fcb) = new_file(&mut session, volume, "BIG.DAT;1", 16);
    for vbn in 1..=16 {
        session
            .write_block(fcb, vbn, &pattern_block(vbn as u8))
            .unwrap();
    }
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();

    let volume = session
        .mount(MountFlag::Write.into(), &[DISK], &[])
        .unwrap();
    let fcb = session.access_file(volume, fid, false).unwrap();
    let mut buf = [0u8; BLOCK_SIZE];
    for vbn in 1..=16 {
        session.read_block(fcb, vbn, &mut buf).unwrap();
        assert_eq!(&buf[..], &pattern_block(vbn as u8)[..], "vbn {vbn}");
    }
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn failed_write_back_keeps_file_open() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (_, fcb) = new_file(&mut session, volume, "FAIL.DAT;1", 1);
    session.write_block(fcb, 1, &pattern_block(9)).unwrap();
    let lbn = session.get_window(fcb, 1).unwrap().lbn.get();

    disk.fail_writes_after(Some(0));
    assert!(matches!(session.deaccess_file(fcb), Err(Error::Io(_))));
    assert_eq!(session.file_refcount(fcb).unwrap(), 1);

    disk.fail_writes_after(None);
    session.deaccess_file(fcb).unwrap();
    assert_eq!(disk.block(u64::from(lbn)), pattern_block(9));
    session.dismount(volume).unwrap();
}

#[test]
fn write_needs_write_access() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (fid, fcb) = new_file(&mut session, volume, "RO.DAT;1", 1);
    session.deaccess_file(fcb).unwrap();

    let fcb = session.access_file(volume, fid, false).unwrap();
    assert!(matches!(
        session.write_block(fcb, 1, &pattern_block(0)),
        Err(Error::WriteLocked)
    ));
    // 再次以写方式打开会升级已有的控制块
    let same = session.access_file(volume, fid, true).unwrap();
    assert_eq!(same, fcb);
    session.write_block(fcb, 1, &pattern_block(0)).unwrap();
    session.deaccess_file(same).unwrap();
    session.deaccess_file(fcb).unwrap();
    assert!(matches!(
        session.access_file(volume, FileId::new(0, 0), false),
        Err(Error::BadParameter)
    ));
    session.dismount(volume).unwrap();
}

#[test]
fn reused_blocks_do_not_leak_old_data() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (old, fcb) = new_file(&mut session, volume, "OLD.DAT;1", 4);
    for vbn in 1..=4 {
        session.write_block(fcb, vbn, &[0xAA; BLOCK_SIZE]).unwrap();
    }
    let old_lbn = session.get_window(fcb, 1).unwrap().lbn;
    session.deaccess_file(fcb).unwrap();
    session.erase_file(volume, old).unwrap();

    let (new, fcb) = new_file(&mut session, volume, "NEW.DAT;1", 4);
    assert_eq!(session.get_window(fcb, 1).unwrap().lbn, old_lbn);
    session.write_block(fcb, 3, &pattern_block(3)).unwrap();
    assert_eq!(session.file_info(fcb).unwrap().highwater, 4);

    let mut buf = [0xFFu8; BLOCK_SIZE];
    for vbn in 1..=2 {
        session.read_block(fcb, vbn, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "vbn {vbn}");
        // 低于新高水位的块在盘上也已清零
        assert!(disk.block(u64::from((old_lbn + (vbn - 1)).get())).iter().all(|&b| b == 0));
    }
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();

    let volume = mount_rw(&mut session);
    let fcb = session.access_file(volume, new, false).unwrap();
    assert_eq!(session.file_info(fcb).unwrap().highwater, 4);
    for vbn in 1..=2 {
        session.read_block(fcb, vbn, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "vbn {vbn} after remount");
    }
    session.read_block(fcb, 3, &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern_block(3)[..]);
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn failed_highwater_raise_releases_chunk() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (_, fcb) = new_file(&mut session, volume, "HOLE.DAT;1", 4);
    disk.fail_writes_after(Some(0));
    assert!(matches!(
        session.write_block(fcb, 3, &pattern_block(3)),
        Err(Error::Io(_))
    ));
    assert_eq!(session.file_info(fcb).unwrap().highwater, 1);

    disk.fail_writes_after(None);
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}
