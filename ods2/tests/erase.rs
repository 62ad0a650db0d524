mod common;

use common::*;
use ods2::{Error, FileId};

#[test]
fn erase_returns_blocks_and_header() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let before = session.free_blocks(volume, 1).unwrap();

    let (fid, fcb) = new_file(&mut session, volume, "GONE.DAT;1", 10);
    assert_eq!(session.free_blocks(volume, 1).unwrap(), before - 10);
    assert!(session.file_number_in_use(volume, 1, fid.number()).unwrap());
    session.write_block(fcb, 3, &pattern_block(3)).unwrap();
    session.deaccess_file(fcb).unwrap();

    session.erase_file(volume, fid).unwrap();
    assert_eq!(session.free_blocks(volume, 1).unwrap(), before);
    assert!(!session.file_number_in_use(volume, 1, fid.number()).unwrap());
    assert!(matches!(
        session.access_file(volume, fid, false),
        Err(Error::NoSuchFile)
    ));

    // 文件号复用时序号加一，旧的 File-ID 失效
    let (again, fcb) = new_file(&mut session, volume, "NEXT.DAT;1", 0);
    assert_eq!(again.number(), fid.number());
    assert_eq!(again.seq, fid.seq + 1);
    session.deaccess_file(fcb).unwrap();
    assert!(matches!(
        session.access_file(volume, fid, false),
        Err(Error::NoSuchFile)
    ));

    session.dismount(volume).unwrap();
}

#[test]
fn open_files_cannot_be_erased() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (fid, fcb) = new_file(&mut session, volume, "BUSY.DAT;1", 2);
    assert!(matches!(
        session.erase_file(volume, fid),
        Err(Error::FileLocked)
    ));
    assert_eq!(session.file_refcount(fcb).unwrap(), 1);
    session.deaccess_file(fcb).unwrap();
    session.erase_file(volume, fid).unwrap();

    assert!(matches!(
        session.erase_file(volume, FileId::MFD),
        Err(Error::BadParameter)
    ));
    session.dismount(volume).unwrap();
}

#[test]
fn shrink_releases_tail() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let before = session.free_blocks(volume, 1).unwrap();

    let (_, fcb) = new_file(&mut session, volume, "TRIM.DAT;1", 10);
    for vbn in 1..=10 {
        session.write_block(fcb, vbn, &pattern_block(vbn as u8)).unwrap();
    }
    session.set_file_size(fcb, 10 * 512).unwrap();

    assert_eq!(session.shrink_file(fcb, 4).unwrap(), 4);
    assert_eq!(session.free_blocks(volume, 1).unwrap(), before - 4);
    let info = session.file_info(fcb).unwrap();
    assert_eq!(info.highest, 4);
    assert_eq!(info.size(), 4 * 512);
    assert!(matches!(
        session.read_block(fcb, 5, &mut [0; 512]),
        Err(Error::EndOfFile)
    ));
    let mut buf = [0u8; 512];
    session.read_block(fcb, 4, &mut buf).unwrap();
    assert_eq!(&buf[..], &pattern_block(4)[..]);

    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn allocation_fails_cleanly_when_full() {
    let disk = fresh_disk(512);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let free = session.free_blocks(volume, 1).unwrap() as u32;

    let (_, fcb) = new_file(&mut session, volume, "FULL.DAT;1", 0);
    assert!(matches!(
        session.extend_file(fcb, free + 1),
        Err(Error::DeviceFull)
    ));
    assert_eq!(session.free_blocks(volume, 1).unwrap(), u64::from(free));
    assert_eq!(session.extend_file(fcb, free).unwrap(), free);
    assert_eq!(session.free_blocks(volume, 1).unwrap(), 0);

    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn erase_releases_extension_headers() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let before = session.free_blocks(volume, 1).unwrap();

    let (p, fp) = new_file(&mut session, volume, "P.DAT;1", 3);
    let (e, fe) = new_file(&mut session, volume, "E.DAT;1", 2);
    session.deaccess_file(fp).unwrap();
    session.deaccess_file(fe).unwrap();
    session.dismount(volume).unwrap();

    patch_header(&disk, p.number(), |h| {
        h.set_ext_fid(e);
        h.set_hiblk(5);
    });

    let volume = mount_rw(&mut session);
    assert_eq!(session.free_blocks(volume, 1).unwrap(), before - 5);
    session.erase_file(volume, p).unwrap();

    assert_eq!(session.free_blocks(volume, 1).unwrap(), before);
    assert!(!session.file_number_in_use(volume, 1, p.number()).unwrap());
    assert!(!session.file_number_in_use(volume, 1, e.number()).unwrap());
    for fid in [p, e] {
        assert!(matches!(
            session.access_file(volume, fid, false),
            Err(Error::NoSuchFile)
        ));
    }
    session.dismount(volume).unwrap();
}

#[test]
fn erase_of_cross_linked_file_changes_nothing() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);

    let (a, fa) = new_file(&mut session, volume, "A.DAT;1", 4);
    let (b, fb) = new_file(&mut session, volume, "B.DAT;1", 0);
    session.deaccess_file(fa).unwrap();
    session.deaccess_file(fb).unwrap();
    session.dismount(volume).unwrap();

    // B 的文件头指向 A 的区段
    let mut words = Vec::new();
    patch_header(&disk, a.number(), |h| words = h.map_words());
    patch_header(&disk, b.number(), |h| {
        h.set_map_words(&words).unwrap();
        h.set_hiblk(4);
    });

    let volume = mount_rw(&mut session);
    session.erase_file(volume, a).unwrap();
    let free = session.free_blocks(volume, 1).unwrap();

    assert!(matches!(
        session.erase_file(volume, b),
        Err(Error::BugCheck(_))
    ));
    assert_eq!(session.free_blocks(volume, 1).unwrap(), free);
    assert!(session.file_number_in_use(volume, 1, b.number()).unwrap());
}
