mod common;

use common::*;
use ods2::layout::dir::{self, DirEntry, DirRecord};
use ods2::{DirAction, Error, Fib, FileId};

fn fid(n: u16) -> FileId {
    FileId::new(n, 1)
}

#[test]
fn versions_stay_ordered() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let dir = new_directory(&mut session, volume, "SUB.DIR;1");

    assert_eq!(enter(&mut session, dir, "A.TXT;1", fid(101)), "A.TXT;1");
    assert_eq!(enter(&mut session, dir, "B.TXT;1", fid(201)), "B.TXT;1");
    assert_eq!(enter(&mut session, dir, "A.TXT;2", fid(102)), "A.TXT;2");

    assert_eq!(lookup(&mut session, dir, "A.TXT;2").unwrap().1, fid(102));
    assert_eq!(lookup(&mut session, dir, "A.TXT;0").unwrap().1, fid(102));
    assert_eq!(lookup(&mut session, dir, "a.txt").unwrap(), ("A.TXT;2".to_owned(), fid(102)));
    assert_eq!(lookup(&mut session, dir, "A.TXT;-1").unwrap().1, fid(101));
    assert_eq!(
        list(&mut session, dir, "A.TXT;*"),
        [
            ("A.TXT;2".to_owned(), fid(102)),
            ("A.TXT;1".to_owned(), fid(101))
        ]
    );

    let mut fib = Fib::new(FileId::MFD);
    let removed = session
        .search_directory(dir, &mut fib, "A.TXT;1", DirAction::Delete)
        .unwrap();
    assert_eq!(removed, "A.TXT;1");
    assert_eq!(fib.fid, fid(101));

    assert_eq!(lookup(&mut session, dir, "A.TXT;2").unwrap().1, fid(102));
    assert!(matches!(
        lookup(&mut session, dir, "A.TXT;1"),
        Err(Error::NoSuchFile)
    ));
    assert_eq!(lookup(&mut session, dir, "B.TXT;1").unwrap().1, fid(201));

    session.deaccess_file(dir).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn insertion_rules() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let dir = new_directory(&mut session, volume, "SUB.DIR;1");

    enter(&mut session, dir, "X.DAT;5", fid(5));
    // 不带版本号时取最高版本加一
    assert_eq!(enter(&mut session, dir, "X.DAT", fid(6)), "X.DAT;6");
    assert_eq!(enter(&mut session, dir, "NEW.DAT", fid(7)), "NEW.DAT;1");

    let mut fib = Fib::with_fid(FileId::MFD, fid(8));
    assert!(matches!(
        session.search_directory(dir, &mut fib, "X.DAT;5", DirAction::Insert),
        Err(Error::DuplicateFileName)
    ));
    assert!(matches!(
        session.search_directory(dir, &mut fib, "*.DAT", DirAction::Insert),
        Err(Error::BadFileName)
    ));
    assert!(matches!(
        session.search_directory(dir, &mut fib, "BAD[NAME.DAT", DirAction::Insert),
        Err(Error::BadFileName)
    ));
    let mut empty = Fib::new(FileId::MFD);
    assert!(matches!(
        session.search_directory(dir, &mut empty, "Y.DAT", DirAction::Insert),
        Err(Error::BadParameter)
    ));

    session.deaccess_file(dir).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn wildcard_listing_of_master_directory() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let mfd = open_mfd(&mut session, volume, false);

    let names: Vec<String> = list(&mut session, mfd, "*.SYS")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(
        names,
        ["BADBLK.SYS;1", "BITMAP.SYS;1", "CORIMG.SYS;1", "INDEXF.SYS;1"]
    );
    assert_eq!(list(&mut session, mfd, "B%%%%%.SYS").len(), 2);
    assert_eq!(
        lookup(&mut session, mfd, "000000.DIR;1").unwrap().1,
        FileId::MFD
    );
    assert!(matches!(
        lookup(&mut session, mfd, "*.NONE"),
        Err(Error::NoSuchFile)
    ));

    let mut fib = Fib::new(FileId::MFD);
    session
        .search_directory(mfd, &mut fib, "*.SYS", DirAction::Lookup)
        .unwrap();
    assert!(fib.wcc.is_some());

    // 普通文件不能当目录用
    let index = session.access_file(volume, FileId::INDEXF, false).unwrap();
    assert!(matches!(
        lookup(&mut session, index, "A.B"),
        Err(Error::BadDirectory)
    ));
    session.deaccess_file(index).unwrap();

    session.deaccess_file(mfd).unwrap();
    session.dismount(volume).unwrap();
}

#[test]
fn blocks_split_and_compact() {
    let disk = fresh_disk(4096);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let dir = new_directory(&mut session, volume, "MANY.DIR;1");

    const COUNT: u16 = 80;
    for i in 0..COUNT {
        let n = (i * 37) % COUNT;
        enter(&mut session, dir, &format!("FILE{n:03}.DAT;1"), fid(1000 + n));
    }
    let info = session.file_info(dir).unwrap();
    assert!(info.eof_block > 3, "only {} block(s)", info.eof_block);

    let listed = list(&mut session, dir, "*.DAT");
    assert_eq!(listed.len(), COUNT as usize);
    for (i, (name, id)) in listed.iter().enumerate() {
        assert_eq!(name, &format!("FILE{i:03}.DAT;1"));
        assert_eq!(*id, fid(1000 + i as u16));
    }
    for n in [0, 17, 41, 79] {
        let (_, found) = lookup(&mut session, dir, &format!("file{n:03}.dat")).unwrap();
        assert_eq!(found, fid(1000 + n));
    }

    for i in 0..COUNT {
        let n = (i * 13) % COUNT;
        let mut fib = Fib::new(FileId::MFD);
        session
            .search_directory(dir, &mut fib, &format!("FILE{n:03}.DAT;1"), DirAction::Delete)
            .unwrap();
    }
    assert!(list(&mut session, dir, "*.*").is_empty());
    let info = session.file_info(dir).unwrap();
    assert!(info.eof_block <= 1);
    assert_eq!(info.highest, 1);

    session.deaccess_file(dir).unwrap();
    session.dismount(volume).unwrap();
}

fn record(name: &str, versions: &[u16]) -> DirRecord {
    DirRecord {
        verlimit: dir::DEFAULT_VERLIMIT,
        flags: 0,
        name: name.as_bytes().to_vec(),
        entries: versions
            .iter()
            .map(|&version| DirEntry {
                version,
                fid: fid(100 + version),
            })
            .collect(),
    }
}

#[test]
fn record_continues_into_next_block() {
    let disk = fresh_disk(2048);
    let mut session = session(&disk);
    let volume = mount_rw(&mut session);
    let sub = new_directory(&mut session, volume, "SUB.DIR;1");

    // A.TXT 的版本 5、4 在第一块，3、2 在第二块
    session.extend_file(sub, 2).unwrap();
    let first = dir::encode_block(&[record("A.TXT", &[5, 4])]).unwrap();
    let second = dir::encode_block(&[record("A.TXT", &[3, 2]), record("B.TXT", &[1])]).unwrap();
    session.write_block(sub, 1, &first).unwrap();
    session.write_block(sub, 2, &second).unwrap();
    session.set_end_of_file(sub, 3, 0).unwrap();

    assert_eq!(lookup(&mut session, sub, "A.TXT;3").unwrap(), ("A.TXT;3".to_owned(), fid(103)));
    assert_eq!(lookup(&mut session, sub, "A.TXT;4").unwrap().1, fid(104));
    assert_eq!(lookup(&mut session, sub, "A.TXT;2").unwrap().1, fid(102));
    assert_eq!(lookup(&mut session, sub, "A.TXT").unwrap().1, fid(105));
    assert_eq!(lookup(&mut session, sub, "A.TXT;-1").unwrap().1, fid(104));
    assert_eq!(lookup(&mut session, sub, "A.TXT;-3").unwrap().1, fid(102));
    assert!(matches!(
        lookup(&mut session, sub, "A.TXT;-4"),
        Err(Error::NoSuchFile)
    ));
    assert!(matches!(
        lookup(&mut session, sub, "A.TXT;1"),
        Err(Error::NoSuchFile)
    ));
    assert_eq!(lookup(&mut session, sub, "B.TXT").unwrap().1, fid(101));

    let names: Vec<_> = list(&mut session, sub, "A.TXT;*").into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, ["A.TXT;5", "A.TXT;4", "A.TXT;3", "A.TXT;2"]);

    session.deaccess_file(sub).unwrap();
    session.dismount(volume).unwrap();
}
