use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{bail, Context};

pub trait ShardFile: std::fmt::Debug + Read {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A flat directory of shard files. Names are plain file names, never paths.
pub trait ShardDir: Clone {
    type File: ShardFile;

    /// Lists the file names in the directory, in whatever order the backing
    /// store returns them.
    fn ls(&mut self) -> anyhow::Result<Vec<String>>;

    /// Creates `fname`, truncating it if it already exists.
    fn create(&mut self, fname: &str) -> anyhow::Result<Self::File>;

    fn open(&mut self, fname: &str) -> anyhow::Result<Option<Self::File>>;

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()>;

    fn unlink(&mut self, fname: &str) -> anyhow::Result<bool>;
}

// OS implementation

#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    file: File,
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ShardFile for OsFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.file
            .write_all(buf)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file
            .sync_all()
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(())
    }

    fn len(&self) -> usize {
        self.file
            .metadata()
            .map(|m| m.len() as usize)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    /// Opens `root` as a shard directory, creating it if needed.
    pub fn open_dir<P>(root: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path> + Into<PathBuf>,
    {
        fs::create_dir_all(root.as_ref())
            .with_context(|| format!("creating shard directory {}", root.as_ref().display()))?;
        Ok(OsDir { root: root.into() })
    }

    /// Opens `root` as a shard directory that must already exist.
    pub fn open_existing<P>(root: P) -> anyhow::Result<Self>
    where
        P: AsRef<Path> + Into<PathBuf>,
    {
        let meta = fs::metadata(root.as_ref())
            .with_context(|| format!("opening shard directory {}", root.as_ref().display()))?;
        if !meta.is_dir() {
            bail!("{} is not a directory", root.as_ref().display());
        }
        Ok(OsDir { root: root.into() })
    }

    fn full_path(&self, fname: &str) -> PathBuf {
        self.root.join(fname)
    }
}

impl ShardDir for OsDir {
    type File = OsFile;

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Names that are not UTF-8 cannot be shards.
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn create(&mut self, fname: &str) -> anyhow::Result<OsFile> {
        let path = self.full_path(fname);
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        Ok(OsFile { path, file })
    }

    fn open(&mut self, fname: &str) -> anyhow::Result<Option<OsFile>> {
        let path = self.full_path(fname);
        match File::open(&path) {
            Ok(file) => Ok(Some(OsFile { path, file })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("opening {}", path.display())),
        }
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        let (from, to) = (self.full_path(from), self.full_path(to));
        fs::rename(&from, &to)
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))?;
        Ok(())
    }

    fn unlink(&mut self, fname: &str) -> anyhow::Result<bool> {
        let path = self.full_path(fname);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

// Mock Implementation
#[derive(Default, Debug)]
struct MockData {
    synced: Vec<u8>,
    unsynced: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MockFile {
    idx: usize,
    pub file_id: FileId,
    fs: Rc<RefCell<MockFs>>,
}

impl MockFile {
    pub fn read_all(&self) -> Vec<u8> {
        (*self.fs).borrow().data[self.file_id].unsynced.clone()
    }

    pub fn read_all_synced(&self) -> Vec<u8> {
        (*self.fs).borrow().data[self.file_id].synced.clone()
    }
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.read_all();
        let remaining = data.len().saturating_sub(self.idx);
        let min_len = std::cmp::min(remaining, buf.len());
        buf[..min_len].copy_from_slice(&data[self.idx..self.idx + min_len]);
        self.idx += min_len;
        Ok(min_len)
    }
}

impl ShardFile for MockFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let data = buf.to_vec();
        (*self.fs)
            .borrow_mut()
            .write(self.file_id, self.idx, data)?;
        self.idx += buf.len();

        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        (*self.fs).borrow_mut().sync(self.file_id)?;
        Ok(())
    }

    fn len(&self) -> usize {
        (*self.fs).borrow().data[self.file_id].unsynced.len()
    }
}

#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Rc<RefCell<MockFs>>,
}

impl MockDir {
    pub fn new() -> Self {
        MockDir {
            fs: Rc::new(RefCell::new(MockFs::new())),
        }
    }

    /// Replaces the contents of `fname` wholesale, bypassing the event log.
    /// Used to plant corrupt or foreign files.
    pub fn plant(&mut self, fname: &str, contents: &[u8]) {
        (*self.fs).borrow_mut().plant(fname, contents)
    }
}

impl Default for MockDir {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardDir for MockDir {
    type File = MockFile;

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut fs = (*self.fs).borrow_mut();
        fs.perform_op()?;
        let fnames: Vec<String> = fs.names.keys().cloned().collect();
        fs.record(Event::Ls(fnames.len()));
        Ok(fnames)
    }

    fn create(&mut self, fname: &str) -> anyhow::Result<MockFile> {
        let file_id = (*self.fs).borrow_mut().create(fname)?;
        Ok(MockFile {
            fs: self.fs.clone(),
            file_id,
            idx: 0,
        })
    }

    fn open(&mut self, fname: &str) -> anyhow::Result<Option<MockFile>> {
        Ok((*self.fs)
            .borrow_mut()
            .open(fname)?
            .map(|file_id| MockFile {
                fs: self.fs.clone(),
                file_id,
                idx: 0,
            }))
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        (*self.fs).borrow_mut().rename(from, to)
    }

    fn unlink(&mut self, fname: &str) -> anyhow::Result<bool> {
        (*self.fs).borrow_mut().unlink(fname)
    }
}

type FileId = usize;

#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Write(FileId, usize),
    Sync(FileId),
    Rename(String, String),
    Unlink(String),
    Open(String),
    Ls(usize),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, file_id) => write!(w, "Create({}, {})", name, file_id),
            Event::Write(file_id, idx) => write!(w, "Write({}, {})", file_id, idx),
            Event::Sync(file_id) => write!(w, "Sync({})", file_id),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Ls(n) => write!(w, "Ls() -> {} names", n),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    names: HashMap<String, FileId>,
    data: Vec<MockData>,
    events: Vec<Event>,

    // After this many "things happen," "crash" the FS, meaning stop accepting
    // any operation.
    time_to_crash: Option<usize>,
}

impl MockFs {
    fn new() -> Self {
        MockFs {
            names: HashMap::new(),
            data: Vec::new(),
            events: Vec::new(),
            time_to_crash: None,
        }
    }

    fn check_crashed(&self) -> anyhow::Result<()> {
        if self.time_to_crash == Some(0) {
            bail!("filesystem is down")
        } else {
            Ok(())
        }
    }

    pub fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }

    fn perform_op(&mut self) -> anyhow::Result<()> {
        self.check_crashed()?;
        if let Some(x) = self.time_to_crash {
            self.time_to_crash = Some(x - 1);
        }
        Ok(())
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Synced contents of `fname`, if it exists.
    pub fn contents(&self, fname: &str) -> Option<Vec<u8>> {
        self.names
            .get(fname)
            .map(|id| self.data[*id].synced.clone())
    }

    fn plant(&mut self, fname: &str, contents: &[u8]) {
        let id = self.data.len();
        self.data.push(MockData {
            synced: contents.to_vec(),
            unsynced: contents.to_vec(),
        });
        self.names.insert(fname.to_owned(), id);
    }

    fn create(&mut self, fname: &str) -> anyhow::Result<FileId> {
        self.perform_op()?;

        // Truncating an existing file gives it fresh storage, like O_TRUNC on
        // a new inode would.
        let id = self.data.len();
        self.data.push(MockData::default());
        self.names.insert(fname.to_owned(), id);
        self.record(Event::Create(fname.to_owned(), id));

        Ok(id)
    }

    fn unlink(&mut self, fname: &str) -> anyhow::Result<bool> {
        self.perform_op()?;

        self.record(Event::Unlink(fname.to_owned()));
        Ok(self.names.remove(fname).is_some())
    }

    fn open(&mut self, fname: &str) -> anyhow::Result<Option<FileId>> {
        self.perform_op()?;

        self.record(Event::Open(fname.to_owned()));
        Ok(self.names.get(fname).cloned())
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Rename(from.to_owned(), to.to_owned()));

        match self.names.remove(from) {
            Some(d) => {
                self.names.insert(to.to_owned(), d);
                Ok(())
            }
            None => bail!("rename of missing file {}", from),
        }
    }

    fn write(&mut self, file: FileId, idx: usize, data: Vec<u8>) -> anyhow::Result<()> {
        self.perform_op()?;

        let unsynced = &mut self.data[file].unsynced;
        if unsynced.len() < idx + data.len() {
            unsynced.resize(idx + data.len(), 0);
        }
        unsynced[idx..idx + data.len()].copy_from_slice(&data);

        self.record(Event::Write(file, idx));
        Ok(())
    }

    fn sync(&mut self, file: FileId) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Sync(file));
        let d = &mut self.data[file];
        d.synced = d.unsynced.clone();

        Ok(())
    }
}

#[test]
fn test_mock_file() -> anyhow::Result<()> {
    let mut dir = MockDir::new();

    let mut a = dir.create("a")?;

    a.write(&[1, 2, 3, 4]).unwrap();

    assert_eq!(Vec::<u8>::new(), a.read_all_synced());
    assert_eq!(vec![1, 2, 3, 4], a.read_all());

    a.sync().unwrap();

    assert_eq!(vec![1, 2, 3, 4], a.read_all_synced());
    assert_eq!(vec![1, 2, 3, 4], a.read_all());

    Ok(())
}

#[test]
fn test_mock_crash() -> anyhow::Result<()> {
    let mut dir = MockDir::new();
    (*dir.fs).borrow_mut().schedule_crash(1);

    dir.create("a")?;
    assert!(dir.create("b").is_err());
    assert!(dir.ls().is_err());

    Ok(())
}

#[test]
fn test_os_dir() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut dir = OsDir::open_dir(tmp.path().join("shards"))?;

    let mut f = dir.create("a.tmp")?;
    f.write(b"hello")?;
    f.sync()?;
    dir.rename("a.tmp", "a")?;

    assert_eq!(dir.ls()?, vec!["a".to_owned()]);
    let mut buf = Vec::new();
    dir.open("a")?.unwrap().read_to_end(&mut buf)?;
    assert_eq!(buf, b"hello");

    assert!(dir.open("missing")?.is_none());
    assert!(dir.unlink("a")?);
    assert!(!dir.unlink("a")?);

    Ok(())
}

#[test]
fn test_open_existing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let missing = tmp.path().join("missing");

    let err = OsDir::open_existing(missing.clone()).unwrap_err();
    assert!(format!("{:#}", err).contains("missing"));
    assert!(!missing.exists());

    fs::write(tmp.path().join("plain"), b"x")?;
    assert!(OsDir::open_existing(tmp.path().join("plain")).is_err());

    OsDir::open_dir(tmp.path().join("shards"))?;
    let mut dir = OsDir::open_existing(tmp.path().join("shards"))?;
    assert!(dir.ls()?.is_empty());

    Ok(())
}
