//! In-process stand-in for the host tools, for tests that must not need
//! root, real loop devices or real filesystems.
//!
//! Loop devices are name-to-file bindings. A "filesystem" is a directory
//! owned by the fake: mounting copies it into the mount point and unmounting
//! a writable mount copies the mount point back. `dd` and `sfdisk` write real
//! bytes into the backing files, so the MBR can be checked afterwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;
use walkdir::WalkDir;

use crate::process::{Cmd, CmdResult, CommandRunner};

type Region = (PathBuf, Option<u64>);

struct Filesystem {
    uuid: String,
    tree: TempDir,
}

struct Mounted {
    region: Region,
    read_only: bool,
}

#[derive(Default)]
struct State {
    loops: BTreeMap<String, Region>,
    mounts: BTreeMap<PathBuf, Mounted>,
    filesystems: HashMap<Region, Filesystem>,
    fixtures: HashMap<PathBuf, PathBuf>,
    last_formatted: Option<Region>,
    formatted_count: u32,
    invocations: Vec<String>,
}

pub struct FakeHost {
    loop_capacity: usize,
    failing: HashSet<String>,
    missing: HashSet<String>,
    state: RefCell<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            loop_capacity: 8,
            failing: HashSet::new(),
            missing: HashSet::new(),
            state: RefCell::new(State::default()),
        }
    }

    pub fn with_loop_capacity(mut self, capacity: usize) -> Self {
        self.loop_capacity = capacity;
        self
    }

    /// Every invocation of `program` exits 1 without side effects.
    pub fn failing(mut self, program: &str) -> Self {
        self.failing.insert(program.to_string());
        self
    }

    /// `program` is reported as not installed.
    pub fn without_tool(mut self, program: &str) -> Self {
        self.missing.insert(program.to_string());
        self
    }

    /// Mounting `image` shows the contents of `tree`.
    pub fn add_fixture(&self, image: &Path, tree: &Path) {
        self.state
            .borrow_mut()
            .fixtures
            .insert(image.to_path_buf(), tree.to_path_buf());
    }

    /// Bind `image` to a free device without going through losetup.
    pub fn bind_for_test(&self, image: &Path) -> String {
        let device = self.free_device().expect("no free fake loop device");
        self.state
            .borrow_mut()
            .loops
            .insert(device.clone(), (image.to_path_buf(), None));
        device
    }

    /// Treat the region of `image` at `offset` as holding an empty filesystem.
    pub fn mark_formatted(&self, image: &Path, offset: Option<u64>) {
        self.create_filesystem((image.to_path_buf(), offset))
            .expect("creating fake filesystem");
    }

    pub fn bound_loop_devices(&self) -> Vec<String> {
        self.state.borrow().loops.keys().cloned().collect()
    }

    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.state.borrow().mounts.keys().cloned().collect()
    }

    pub fn invocations(&self) -> Vec<String> {
        self.state.borrow().invocations.clone()
    }

    pub fn count_invocations(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .invocations
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Contents of the most recently formatted filesystem as of its last
    /// unmount.
    pub fn formatted_tree(&self) -> Option<PathBuf> {
        let state = self.state.borrow();
        let region = state.last_formatted.as_ref()?;
        state.filesystems.get(region).map(|fs| fs.tree.path().to_path_buf())
    }

    pub fn formatted_uuid(&self) -> Option<String> {
        let state = self.state.borrow();
        let region = state.last_formatted.as_ref()?;
        state.filesystems.get(region).map(|fs| fs.uuid.clone())
    }

    fn free_device(&self) -> Option<String> {
        let state = self.state.borrow();
        (0..self.loop_capacity)
            .map(|n| format!("/dev/loop{}", n))
            .find(|dev| !state.loops.contains_key(dev))
    }

    fn create_filesystem(&self, region: Region) -> io::Result<String> {
        let mut state = self.state.borrow_mut();
        state.formatted_count += 1;
        let n = state.formatted_count;
        let uuid = format!("5eed{:04x}-0000-4000-8000-{:012x}", n, n);
        let tree = TempDir::new()?;
        fs::create_dir(tree.path().join("lost+found"))?;
        state.filesystems.insert(
            region.clone(),
            Filesystem {
                uuid: uuid.clone(),
                tree,
            },
        );
        state.last_formatted = Some(region);
        Ok(uuid)
    }

    fn region_of(&self, device: &str) -> Option<Region> {
        self.state.borrow().loops.get(device).cloned()
    }

    fn losetup(&self, args: &[String]) -> io::Result<CmdResult> {
        let mut offset = None;
        let mut find = false;
        let mut detach = None;
        let mut lookup = None;
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--find" | "-f" => find = true,
                "-o" => offset = iter.next().and_then(|v| v.parse::<u64>().ok()),
                "-d" => detach = iter.next().cloned(),
                "-j" => lookup = iter.next().map(PathBuf::from),
                _ => positional.push(arg.clone()),
            }
        }

        if find {
            return Ok(match self.free_device() {
                Some(dev) => ok(format!("{}\n", dev)),
                None => fail("losetup: cannot find an unused loop device"),
            });
        }
        if let Some(device) = detach {
            return Ok(match self.state.borrow_mut().loops.remove(&device) {
                Some(_) => ok(String::new()),
                None => fail(&format!("losetup: {}: detach failed", device)),
            });
        }
        if let Some(file) = lookup {
            let state = self.state.borrow();
            let lines: String = state
                .loops
                .iter()
                .filter(|(_, (f, o))| *f == file && (offset.is_none() || *o == offset))
                .map(|(dev, (f, o))| match o {
                    Some(o) => format!("{}: [0045]:1 ({}), offset {}\n", dev, f.display(), o),
                    None => format!("{}: [0045]:1 ({})\n", dev, f.display()),
                })
                .collect();
            return Ok(ok(lines));
        }

        match positional.as_slice() {
            [device] => Ok(match self.region_of(device) {
                Some((file, _)) => ok(format!("{}: [0045]:1 ({})\n", device, file.display())),
                None => fail(&format!("losetup: {}: No such device or address", device)),
            }),
            [device, file] => {
                let file = PathBuf::from(file);
                if !file.is_file() {
                    return Ok(fail(&format!("losetup: {}: failed to set up loop device", file.display())));
                }
                let mut state = self.state.borrow_mut();
                if state.loops.contains_key(device) {
                    return Ok(fail(&format!("losetup: {}: Device or resource busy", device)));
                }
                state.loops.insert(device.clone(), (file, offset));
                Ok(ok(String::new()))
            }
            _ => Ok(fail("losetup: bad usage")),
        }
    }

    fn mount(&self, args: &[String]) -> io::Result<CmdResult> {
        let mut read_only = false;
        let mut positional = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "-o" {
                read_only = iter
                    .next()
                    .map_or(false, |opts| opts.split(',').any(|o| o == "ro"));
            } else {
                positional.push(arg.clone());
            }
        }
        let [device, dir] = positional.as_slice() else {
            return Ok(fail("mount: bad usage"));
        };
        let dir = PathBuf::from(dir);
        let Some(region) = self.region_of(device) else {
            return Ok(fail(&format!("mount: {}: special device does not exist", device)));
        };
        if !dir.is_dir() {
            return Ok(fail(&format!("mount: {}: mount point does not exist", dir.display())));
        }
        if self.state.borrow().mounts.contains_key(&dir) {
            return Ok(fail(&format!("mount: {}: already mounted", dir.display())));
        }

        let source = {
            let state = self.state.borrow();
            match state.filesystems.get(&region) {
                Some(fs) => Some(fs.tree.path().to_path_buf()),
                None if region.1.is_none() => state.fixtures.get(&region.0).cloned(),
                None => None,
            }
        };
        let Some(source) = source else {
            return Ok(fail(&format!("mount: {}: wrong fs type, bad option, bad superblock", device)));
        };
        copy_tree(&source, &dir)?;
        self.state
            .borrow_mut()
            .mounts
            .insert(dir, Mounted { region, read_only });
        Ok(ok(String::new()))
    }

    fn umount(&self, args: &[String]) -> io::Result<CmdResult> {
        let [dir] = args else {
            return Ok(fail("umount: bad usage"));
        };
        let dir = PathBuf::from(dir);
        let Some(mounted) = self.state.borrow_mut().mounts.remove(&dir) else {
            return Ok(fail(&format!("umount: {}: not mounted", dir.display())));
        };
        if !mounted.read_only {
            let tree = self
                .state
                .borrow()
                .filesystems
                .get(&mounted.region)
                .map(|fs| fs.tree.path().to_path_buf());
            if let Some(tree) = tree {
                clear_dir(&tree)?;
                copy_tree(&dir, &tree)?;
            }
        }
        clear_dir(&dir)?;
        Ok(ok(String::new()))
    }

    fn dd(&self, args: &[String]) -> io::Result<CmdResult> {
        let value = |key: &str| {
            args.iter()
                .find_map(|a| a.strip_prefix(key).map(str::to_string))
        };
        let (Some(input), Some(device), Some(bs)) = (value("if="), value("of="), value("bs=")) else {
            return Ok(fail("dd: bad usage"));
        };
        let Some((file, offset)) = self.region_of(&device) else {
            return Ok(fail(&format!("dd: failed to open '{}'", device)));
        };
        let bs: usize = bs.parse().map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let data = fs::read(input)?;
        let data = &data[..bs.min(data.len())];
        let mut out = OpenOptions::new().write(true).open(file)?;
        out.seek(SeekFrom::Start(offset.unwrap_or(0)))?;
        out.write_all(data)?;
        Ok(ok(String::new()))
    }

    fn sfdisk(&self, cmd: &Cmd, args: &[String]) -> io::Result<CmdResult> {
        let Some(device) = args.iter().find(|a| !a.starts_with('-')) else {
            return Ok(fail("sfdisk: no device"));
        };
        let Some((file, offset)) = self.region_of(device) else {
            return Ok(fail(&format!("sfdisk: cannot open {}", device)));
        };
        let script = cmd.stdin_data().unwrap_or_default();
        let Some(start) = script
            .lines()
            .find_map(|l| l.trim().strip_prefix("start="))
            .and_then(|rest| rest.split(',').next())
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return Ok(fail("sfdisk: no partition in script"));
        };
        let base = offset.unwrap_or(0);
        let total = (fs::metadata(&file)?.len() - base) / 512;
        let bootable = script.contains("bootable");

        let mut entry = [0u8; 16];
        entry[0] = if bootable { 0x80 } else { 0 };
        entry[4] = 0x83;
        entry[8..12].copy_from_slice(&(start as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&((total - start) as u32).to_le_bytes());

        let mut out = OpenOptions::new().write(true).open(&file)?;
        out.seek(SeekFrom::Start(base + 446))?;
        out.write_all(&entry)?;
        out.seek(SeekFrom::Start(base + 510))?;
        out.write_all(&[0x55, 0xAA])?;
        Ok(ok(String::new()))
    }

    fn mke2fs(&self, args: &[String]) -> io::Result<CmdResult> {
        let Some(device) = args.last() else {
            return Ok(fail("mke2fs: no device"));
        };
        let Some(region) = self.region_of(device) else {
            return Ok(fail(&format!("mke2fs: No such file or directory while trying to determine filesystem size of {}", device)));
        };
        self.create_filesystem(region)?;
        Ok(ok(String::new()))
    }

    fn blkid(&self, args: &[String]) -> io::Result<CmdResult> {
        let uuid = args.last().and_then(|device| {
            let region = self.region_of(device)?;
            let state = self.state.borrow();
            state.filesystems.get(&region).map(|fs| fs.uuid.clone())
        });
        Ok(match uuid {
            Some(uuid) => ok(format!("{}\n", uuid)),
            None => CmdResult {
                status: Some(2),
                ..Default::default()
            },
        })
    }

    fn extlinux(&self, args: &[String]) -> io::Result<CmdResult> {
        let Some(dir) = args.iter().find(|a| !a.starts_with('-')).map(PathBuf::from) else {
            return Ok(fail("extlinux: no directory"));
        };
        if !dir.is_dir() {
            return Ok(fail(&format!("extlinux: cannot open directory {}", dir.display())));
        }
        fs::write(dir.join("ldlinux.sys"), b"ldlinux")?;
        Ok(ok(String::new()))
    }
}

impl CommandRunner for FakeHost {
    fn execute(&self, cmd: &Cmd) -> io::Result<CmdResult> {
        self.state.borrow_mut().invocations.push(cmd.display());
        if self.failing.contains(cmd.program()) {
            return Ok(fail(&format!("{}: simulated failure", cmd.program())));
        }

        let args: Vec<String> = cmd
            .arg_list()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        match cmd.program() {
            "losetup" => self.losetup(&args),
            "mount" => self.mount(&args),
            "umount" => self.umount(&args),
            "mountpoint" => {
                let dir = args.last().map(PathBuf::from).unwrap_or_default();
                Ok(if self.state.borrow().mounts.contains_key(&dir) {
                    ok(String::new())
                } else {
                    CmdResult {
                        status: Some(32),
                        ..Default::default()
                    }
                })
            }
            "dd" => self.dd(&args),
            "sfdisk" => self.sfdisk(cmd, &args),
            "mke2fs" => self.mke2fs(&args),
            "blkid" => self.blkid(&args),
            "extlinux" => self.extlinux(&args),
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not emulated", other),
            )),
        }
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        if self.missing.contains(program) {
            return None;
        }
        Some(Path::new("/usr/sbin").join(program))
    }
}

/// Lay out a Live image tree for `arch` under `dir` and return `dir`.
pub fn write_live_tree(dir: &Path, arch: &str, with_overlay: bool) -> PathBuf {
    let live = dir.join("LiveOS");
    let boot = dir.join("isolinux");
    fs::create_dir_all(&live).unwrap();
    fs::create_dir_all(boot.join("themes")).unwrap();

    fs::write(live.join("squashfs.img"), format!("{} squashfs", arch)).unwrap();
    if with_overlay {
        fs::write(live.join("osmin.img"), format!("{} osmin", arch)).unwrap();
    }
    fs::write(boot.join("vmlinuz0"), format!("{} kernel", arch)).unwrap();
    fs::write(boot.join("initrd0.img"), format!("{} initrd", arch)).unwrap();
    fs::write(boot.join("isolinux.cfg"), "default vesamenu.c32\n").unwrap();
    fs::write(boot.join("splash.jpg"), [0xFFu8, 0xD8, 0xFF]).unwrap();
    fs::write(boot.join("themes/default.cfg"), "menu title Live\n").unwrap();
    dir.to_path_buf()
}

/// Shared buffer the capturing subscriber writes formatted events into.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a subscriber on this thread and return what it logged.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (value, logs)
}

fn ok(stdout: String) -> CmdResult {
    CmdResult {
        status: Some(0),
        stdout,
        stderr: String::new(),
    }
}

fn fail(stderr: &str) -> CmdResult {
    CmdResult {
        status: Some(1),
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
