use block_dev::{BlockFile, BLOCK_SIZE};
use ods2::{
    format, DirAction, Fib, FileId, FormatOptions, ImageOpener, MountFlag, MountFlags, Session,
};

/// 10 MiB
const IMAGE_BLOCKS: u64 = 10 * 1024 * 1024 / BLOCK_SIZE as u64;

#[test]
fn write_remount_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    let image = path.to_str().unwrap();
    {
        let file = BlockFile::create(&path, IMAGE_BLOCKS).unwrap();
        let options = FormatOptions {
            label: "E2E".to_owned(),
            ..FormatOptions::default()
        };
        format(&file, &options).unwrap();
    }

    let payload: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let fid = {
        let mut session = Session::new(ImageOpener);
        let volume = session
            .mount(MountFlag::Write.into(), &[image], &["E2E"])
            .unwrap();

        let fid = session
            .create_file(volume, "TEST.DAT;1", Default::default(), FileId::MFD)
            .unwrap();
        let fcb = session.access_file(volume, fid, true).unwrap();
        assert_eq!(session.extend_file(fcb, 3).unwrap(), 3);

        let cref = session.access_chunk(fcb, 1, 2).unwrap();
        assert_eq!(cref.modmask, 0b11);
        session.chunk_data_mut(&cref).unwrap()[..payload.len()].copy_from_slice(&payload);
        session
            .deaccess_chunk(cref.chunk, cref.modmask, true)
            .unwrap();
        session.set_file_size(fcb, payload.len() as u64).unwrap();
        session.deaccess_file(fcb).unwrap();

        let mfd = session.access_file(volume, FileId::MFD, true).unwrap();
        let mut fib = Fib::with_fid(FileId::MFD, fid);
        let entered = session
            .search_directory(mfd, &mut fib, "TEST.DAT;1", DirAction::Insert)
            .unwrap();
        assert_eq!(entered, "TEST.DAT;1");
        session.deaccess_file(mfd).unwrap();
        session.dismount(volume).unwrap();
        fid
    };

    let mut session = Session::new(ImageOpener);
    let volume = session
        .mount(MountFlags::empty(), &[image], &[])
        .unwrap();
    let mfd = session.access_file(volume, FileId::MFD, false).unwrap();
    let mut fib = Fib::new(FileId::MFD);
    session
        .search_directory(mfd, &mut fib, "TEST.DAT;1", DirAction::Lookup)
        .unwrap();
    assert_eq!(fib.fid, fid);
    session.deaccess_file(mfd).unwrap();

    let fcb = session.access_file(volume, fib.fid, false).unwrap();
    let info = session.file_info(fcb).unwrap();
    assert_eq!(info.name, "TEST.DAT;1");
    assert_eq!(info.highest, 3);
    assert_eq!(info.size(), payload.len() as u64);

    let mut back = vec![0u8; payload.len()];
    for (i, block) in back.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        session.read_block(fcb, i as u32 + 1, block).unwrap();
    }
    assert_eq!(back, payload);
    session.deaccess_file(fcb).unwrap();
    session.dismount(volume).unwrap();
}
