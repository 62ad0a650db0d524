mod cli;

use std::fs;
use std::path::Path;

use block_dev::{BlockFile, BLOCK_SIZE};
use clap::Parser;
use ods2::direct::name_check;
use ods2::{
    format, DirAction, Error, Fib, FileHandle, FileId, FormatOptions, ImageOpener, MountFlag,
    MountFlags, Session, VolumeHandle,
};
use typed_bytesize::ByteSizeIec;

use self::cli::{Cli, Command};

fn main() -> ods2::Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Format {
            image,
            size_mib,
            label,
            cluster,
            headers,
        } => {
            let disk_size = ByteSizeIec::mib(size_mib).0;
            let file = BlockFile::create(&image, disk_size / BLOCK_SIZE as u64)?;
            let options = FormatOptions {
                label,
                cluster,
                headers,
                ..FormatOptions::default()
            };
            let home = format(&file, &options)?;
            println!(
                "{}: {} blocks, volume {}",
                image.display(),
                disk_size / BLOCK_SIZE as u64,
                home.label()
            );
        }
        Command::Dir { image, pattern } => {
            with_volume(&image, false, |session, volume| dir(session, volume, &pattern))?;
        }
        Command::Put {
            image,
            source,
            name,
        } => {
            let name = match name {
                Some(name) => name,
                None => source
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or(Error::BadFileName)?
                    .to_owned(),
            };
            let data = fs::read(&source)?;
            with_volume(&image, true, |session, volume| {
                let stored = put(session, volume, &name, &data)?;
                println!("{} -> {stored} ({} bytes)", source.display(), data.len());
                Ok(())
            })?;
        }
        Command::Get {
            image,
            name,
            target,
        } => {
            let data = with_volume(&image, false, |session, volume| get(session, volume, &name))?;
            fs::write(&target, &data)?;
            println!("{name} -> {} ({} bytes)", target.display(), data.len());
        }
        Command::Delete { image, name } => {
            with_volume(&image, true, |session, volume| {
                let removed = delete(session, volume, &name)?;
                println!("deleted {removed}");
                Ok(())
            })?;
        }
    }

    Ok(())
}

/// 挂载镜像，执行`f`后卸载
fn with_volume<R>(
    image: &Path,
    write: bool,
    f: impl FnOnce(&mut Session, VolumeHandle) -> ods2::Result<R>,
) -> ods2::Result<R> {
    let name = image.to_str().ok_or(Error::NoSuchDevice)?;
    let mut session = Session::new(ImageOpener);
    let flags = if write {
        MountFlag::Write.into()
    } else {
        MountFlags::empty()
    };
    let volume = session.mount(flags, &[name], &[])?;
    let result = f(&mut session, volume);
    session.dismount(volume)?;
    result
}

/// 打开主目录执行`f`，无论成败都关闭
fn with_mfd<R>(
    session: &mut Session,
    volume: VolumeHandle,
    write: bool,
    f: impl FnOnce(&mut Session, FileHandle) -> ods2::Result<R>,
) -> ods2::Result<R> {
    let mfd = session.access_file(volume, FileId::MFD, write)?;
    let result = f(session, mfd);
    session.deaccess_file(mfd)?;
    result
}

fn dir(session: &mut Session, volume: VolumeHandle, pattern: &str) -> ods2::Result<()> {
    let found = with_mfd(session, volume, false, |session, mfd| {
        let mut fib = Fib::new(FileId::MFD);
        let mut found = Vec::new();
        loop {
            match session.search_directory(mfd, &mut fib, pattern, DirAction::Lookup) {
                Ok(name) => found.push((name, fib.fid)),
                Err(Error::NoMoreFiles | Error::NoSuchFile) => break,
                Err(e) => return Err(e),
            }
            if fib.wcc.is_none() {
                break;
            }
        }
        Ok(found)
    })?;

    println!("Directory of {} [000000]", session.volume(volume)?.label());
    let mut total = 0;
    for (name, fid) in &found {
        let fcb = session.access_file(volume, *fid, false)?;
        let info = session.file_info(fcb);
        session.deaccess_file(fcb)?;
        let info = info?;
        total += u64::from(info.highest);
        let used = info.size().div_ceil(BLOCK_SIZE as u64);
        println!("{name:<24} {used:>8}/{:<8} {fid}", info.highest);
    }
    println!("Total of {} file(s), {total} block(s)", found.len());
    Ok(())
}

fn put(session: &mut Session, volume: VolumeHandle, name: &str, data: &[u8]) -> ods2::Result<String> {
    let spec = name_check(name)?;
    if spec.wild || spec.version < 0 {
        return Err(Error::BadFileName);
    }
    let version = match spec.version {
        0 => with_mfd(session, volume, false, |session, mfd| {
            let mut fib = Fib::new(FileId::MFD);
            match session.search_directory(mfd, &mut fib, &spec.name, DirAction::Lookup) {
                Ok(found) => Ok(found
                    .rsplit_once(';')
                    .and_then(|(_, v)| v.parse::<i32>().ok())
                    .map_or(1, |v| v + 1)),
                Err(Error::NoSuchFile) => Ok(1),
                Err(e) => Err(e),
            }
        })?,
        v => v,
    };
    let full = format!("{};{version}", spec.name);

    let fid = session.create_file(volume, &full, Default::default(), FileId::MFD)?;
    let fcb = session.access_file(volume, fid, true)?;
    let written = write_all(session, fcb, data);
    session.deaccess_file(fcb)?;
    if let Err(e) = written {
        session.erase_file(volume, fid)?;
        return Err(e);
    }

    with_mfd(session, volume, true, |session, mfd| {
        let mut fib = Fib::with_fid(FileId::MFD, fid);
        session.search_directory(mfd, &mut fib, &full, DirAction::Insert)
    })
}

fn write_all(session: &mut Session, fcb: FileHandle, data: &[u8]) -> ods2::Result<()> {
    let blocks = data.len().div_ceil(BLOCK_SIZE) as u32;
    session.extend_file(fcb, blocks)?;
    let mut block = [0u8; BLOCK_SIZE];
    for (i, part) in data.chunks(BLOCK_SIZE).enumerate() {
        block.fill(0);
        block[..part.len()].copy_from_slice(part);
        session.write_block(fcb, i as u32 + 1, &block)?;
    }
    session.set_file_size(fcb, data.len() as u64)
}

fn get(session: &mut Session, volume: VolumeHandle, name: &str) -> ods2::Result<Vec<u8>> {
    let fid = with_mfd(session, volume, false, |session, mfd| {
        let mut fib = Fib::new(FileId::MFD);
        session.search_directory(mfd, &mut fib, name, DirAction::Lookup)?;
        Ok(fib.fid)
    })?;

    let fcb = session.access_file(volume, fid, false)?;
    let data = read_all(session, fcb);
    session.deaccess_file(fcb)?;
    data
}

fn read_all(session: &mut Session, fcb: FileHandle) -> ods2::Result<Vec<u8>> {
    let info = session.file_info(fcb)?;
    let size = usize::try_from(info.size()).map_err(|_| Error::InsufficientMemory)?;
    let blocks = size.div_ceil(BLOCK_SIZE) as u32;
    let mut data = vec![0u8; blocks as usize * BLOCK_SIZE];
    for (i, block) in data.chunks_exact_mut(BLOCK_SIZE).enumerate() {
        session.read_block(fcb, i as u32 + 1, block)?;
    }
    data.truncate(size);
    Ok(data)
}

fn delete(session: &mut Session, volume: VolumeHandle, name: &str) -> ods2::Result<String> {
    let (removed, fid) = with_mfd(session, volume, true, |session, mfd| {
        let mut fib = Fib::new(FileId::MFD);
        let removed = session.search_directory(mfd, &mut fib, name, DirAction::Delete)?;
        Ok((removed, fib.fid))
    })?;
    session.erase_file(volume, fid)?;
    Ok(removed)
}
