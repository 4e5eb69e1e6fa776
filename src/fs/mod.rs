use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::bail;

pub trait DbFile: std::fmt::Debug + Read + Seek {
    /// Writes at the current position, extending the file as needed.
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
    fn len(&self) -> anyhow::Result<u64>;

    fn read_all(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut result = Vec::new();
        self.seek(SeekFrom::Start(0))?;
        self.read_to_end(&mut result)?;
        Ok(result)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write(buf)
    }
}

pub trait DbDir: Clone + std::fmt::Debug {
    type DbFile: DbFile;

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>;

    fn ls(&mut self) -> anyhow::Result<Vec<String>>;

    /// Returns `None` if the file already exists.
    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>;
}

// OS implementation

#[derive(Debug)]
pub struct OsFile {
    file: File,
}

impl Read for OsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for OsFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl DbFile for OsFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> anyhow::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(OsDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }
}

impl DbDir for OsDir {
    type DbFile = OsFile;

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        match fs::remove_file(self.root.join(fname)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut result = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            result.push(entry?.file_name().to_string_lossy().into_owned());
        }
        result.sort();
        Ok(result)
    }

    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.root.join(fname))
        {
            Ok(file) => Ok(Some(OsFile { file })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let path = self.root.join(fname);
        let opened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|e| match e.kind() {
                // Read-only media still serve read-only indexes.
                io::ErrorKind::PermissionDenied => File::open(&path),
                _ => Err(e),
            });
        match opened {
            Ok(file) => Ok(Some(OsFile { file })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        fs::rename(self.root.join(from), self.root.join(to))?;
        Ok(())
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
    file_id: FileId,
    fs: Rc<RefCell<MockFs>>,
}

impl MockFile {
    #[cfg(test)]
    fn read_all_synced(&self) -> Vec<u8> {
        (*self.fs).borrow().data[self.file_id].synced.clone()
    }

    fn unsynced_len(&self) -> usize {
        (*self.fs).borrow().data[self.file_id].unsynced.len()
    }
}

impl Seek for MockFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(i) => i as i64,
            SeekFrom::End(i) => self.unsynced_len() as i64 + i,
            SeekFrom::Current(i) => self.idx as i64 + i,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.idx = target as usize;
        Ok(self.idx as u64)
    }
}

impl Read for MockFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fs = (*self.fs).borrow();
        let data = &fs.data[self.file_id].unsynced;
        let min_len = std::cmp::min(data.len().saturating_sub(self.idx), buf.len());
        if min_len == 0 {
            return Ok(0);
        }
        buf[..min_len].copy_from_slice(&data[self.idx..self.idx + min_len]);
        self.idx += min_len;
        Ok(min_len)
    }
}

impl DbFile for MockFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        (*self.fs)
            .borrow_mut()
            .write(self.file_id, self.idx, buf.to_vec())?;
        self.idx += buf.len();

        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        (*self.fs).borrow_mut().sync(self.file_id)?;
        Ok(())
    }

    fn len(&self) -> anyhow::Result<u64> {
        Ok(self.unsynced_len() as u64)
    }
}

#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Rc<RefCell<MockFs>>,
}

impl MockDir {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        MockDir {
            fs: Rc::new(RefCell::new(MockFs::new())),
        }
    }

    fn name<P>(p: &P) -> String
    where
        P: AsRef<Path>,
    {
        p.as_ref().to_string_lossy().into_owned()
    }

    fn file(&self, file_id: FileId) -> MockFile {
        MockFile {
            fs: self.fs.clone(),
            file_id,
            idx: 0,
        }
    }
}

impl DbDir for MockDir {
    type DbFile = MockFile;

    fn unlink<P>(&mut self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        (*self.fs).borrow_mut().unlink(Self::name(fname))
    }

    fn ls(&mut self) -> anyhow::Result<Vec<String>> {
        let mut fs = (*self.fs).borrow_mut();
        let mut fnames: Vec<String> = fs.names.keys().cloned().collect();
        fnames.sort();
        fs.record(Event::Ls(fnames.clone()));
        Ok(fnames)
    }

    fn create<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let created = (*self.fs).borrow_mut().create(Self::name(fname))?;
        Ok(created.map(|file_id| self.file(file_id)))
    }

    fn open<P>(&mut self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let opened = (*self.fs).borrow_mut().open(Self::name(fname));
        Ok(opened.map(|file_id| self.file(file_id)))
    }

    fn rename<P, Q>(&mut self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        (*self.fs)
            .borrow_mut()
            .rename(Self::name(from), Self::name(to))
    }
}

type FileId = usize;

#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Write(FileId, usize, Vec<u8>),
    Sync(FileId),
    Rename(String, String),
    Unlink(String),
    Open(String),
    Ls(Vec<String>),
}

impl Event {
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, file_id) => write!(w, "Create({}, {})", name, file_id),
            // Blob payloads are binary, only their extent is interesting.
            Event::Write(file_id, idx, contents) => {
                write!(w, "Write({}, {}..{})", file_id, idx, idx + contents.len())
            }
            Event::Sync(file_id) => write!(w, "Sync({})", file_id),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Ls(names) => write!(w, "Ls() -> {:?}", names),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    names: HashMap<String, FileId>,
    data: Vec<MockData>,
    events: Vec<Event>,

    // After this many "things happen," "crash" the FS, meaning stop accepting
    // writes and discard any unsynced data.
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

    // Discard all unsynced state, become uncrashed.
    pub fn reboot(&mut self) {
        for f in self.data.iter_mut() {
            f.unsynced.clear();
            f.unsynced.extend(&f.synced);
        }
        self.time_to_crash = None;
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

    fn create(&mut self, path: String) -> anyhow::Result<Option<FileId>> {
        self.perform_op()?;

        if self.names.contains_key(&path) {
            return Ok(None);
        }
        let id = self.data.len();
        self.record(Event::Create(path.clone(), id));
        self.names.insert(path, id);
        self.data.push(MockData::default());

        Ok(Some(id))
    }

    fn unlink(&mut self, path: String) -> anyhow::Result<bool> {
        self.perform_op()?;

        let existed = self.names.remove(&path).is_some();
        self.record(Event::Unlink(path));
        Ok(existed)
    }

    fn open(&mut self, path: String) -> Option<FileId> {
        let result = self.names.get(&path).cloned();
        self.record(Event::Open(path));
        result
    }

    fn rename(&mut self, from: String, to: String) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Rename(from.clone(), to.clone()));

        match self.names.remove(&from) {
            Some(d) => {
                self.names.insert(to, d);
                Ok(())
            }
            None => bail!("rename: {} does not exist", from),
        }
    }

    fn write(&mut self, file: FileId, idx: usize, data: Vec<u8>) -> anyhow::Result<()> {
        self.perform_op()?;

        let unsynced = &mut self.data[file].unsynced;
        if unsynced.len() < idx + data.len() {
            unsynced.resize(idx + data.len(), 0);
        }
        unsynced[idx..idx + data.len()].copy_from_slice(&data);

        self.record(Event::Write(file, idx, data));
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
