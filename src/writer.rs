//! Size-based rotating writer for the request log.
//!
//! Lines go to the active file at the configured path. When appending a line
//! would push the active file past `max_bytes`, the archive chain
//! `path.1 .. path.N` is shifted, the active file becomes `path.1` and a fresh
//! active file is started. The oldest archive falls off the end.
use {
    crate::config::RotationConfig,
    derive_more::Display,
    serde_derive::Deserialize,
    std::{
        ffi::OsString,
        fs::{self, File, OpenOptions},
        io::{self, Write},
        path::{Path, PathBuf},
        sync::{Mutex, MutexGuard, PoisonError},
    },
};

// ---

/// Secondary sink every persisted line is mirrored to.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tee {
    Stdout,
    Stderr,
    #[serde(alias = "none")]
    Off,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Op {
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "write")]
    Write,
    #[display(fmt = "rename")]
    Rename,
    #[display(fmt = "delete")]
    Delete,
}

#[derive(Debug, Display)]
pub enum WriterError {
    #[display(fmt = "unable to {} {:?}: {}", op, path, cause)]
    Io {
        op: Op,
        path: PathBuf,
        cause: io::Error,
    },
    #[display(fmt = "writer closed")]
    Closed,
    /// Rotation triggered by `write` failed. The line has still been
    /// persisted to the active file.
    #[display(fmt = "rotation failed: {}", _0)]
    Rotation(Box<WriterError>),
}

impl WriterError {
    pub fn is_rotation(&self) -> bool {
        matches!(self, WriterError::Rotation(_))
    }
}

impl std::error::Error for WriterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriterError::Io { cause, .. } => Some(cause),
            WriterError::Closed => None,
            WriterError::Rotation(inner) => Some(&**inner),
        }
    }
}

fn failed(op: Op, path: &Path) -> impl FnOnce(io::Error) -> WriterError + '_ {
    move |cause| WriterError::Io {
        op,
        path: path.to_path_buf(),
        cause,
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum WriterState {
    #[display(fmt = "uninitialized")]
    Uninitialized,
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "closed")]
    Closed,
}

/// Path of the `index`th archive of `path`, e.g. `requests.log.2`.
pub fn archive_path(path: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

// ---

enum Handle {
    Uninitialized,
    Open(File),
    Closed,
}

struct Active {
    handle: Handle,
    size: u64,
}

pub struct RotatingLogWriter {
    path: PathBuf,
    max_bytes: u64,
    backup_count: usize,
    mirror: Mutex<Box<dyn Write + Send>>,
    active: Mutex<Active>,
}

impl RotatingLogWriter {
    /// Creates a writer without touching the disk. The active file is opened
    /// by the first `write` or `rotate`.
    pub fn new(config: &RotationConfig) -> Self {
        let mirror: Box<dyn Write + Send> = match config.tee {
            Tee::Stdout => Box::new(io::stdout()),
            Tee::Stderr => Box::new(io::stderr()),
            Tee::Off => Box::new(io::sink()),
        };
        Self::with_mirror(config, mirror)
    }

    /// Like [`RotatingLogWriter::new`], mirroring lines to `mirror` instead of
    /// the configured tee. Errors from `mirror` are ignored.
    pub fn with_mirror(config: &RotationConfig, mirror: Box<dyn Write + Send>) -> Self {
        Self {
            path: config.path.clone(),
            max_bytes: config.max_bytes,
            backup_count: config.backup_count,
            mirror: Mutex::new(mirror),
            active: Mutex::new(Active {
                handle: Handle::Uninitialized,
                size: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        match self.lock().handle {
            Handle::Uninitialized => WriterState::Uninitialized,
            Handle::Open(_) => WriterState::Open,
            Handle::Closed => WriterState::Closed,
        }
    }

    /// Bytes in the active file as tracked by the writer.
    pub fn current_size(&self) -> u64 {
        self.lock().size
    }

    /// Appends `line` and a line feed to the active file, rotating first if
    /// the line would not fit.
    ///
    /// A failed rotation does not lose the line: it is appended to the
    /// oversized active file and [`WriterError::Rotation`] is returned.
    /// Rotation is retried on the next write.
    pub fn write(&self, line: &str) -> Result<(), WriterError> {
        let result = self.append(line);
        if !matches!(result, Err(WriterError::Closed)) {
            self.mirror(line);
        }
        result
    }

    /// Rotates the archive chain now, regardless of the active file's size.
    pub fn rotate(&self) -> Result<(), WriterError> {
        let mut guard = self.lock();
        if let Handle::Closed = guard.handle {
            return Err(WriterError::Closed);
        }
        self.rotate_locked(&mut guard)
    }

    /// Syncs and releases the active file. Further writes fail with
    /// [`WriterError::Closed`].
    pub fn close(&self) -> Result<(), WriterError> {
        let mut guard = self.lock();
        let result = match &guard.handle {
            Handle::Open(file) => file.sync_all().map_err(failed(Op::Write, &self.path)),
            Handle::Uninitialized | Handle::Closed => Ok(()),
        };
        guard.handle = Handle::Closed;
        result
    }

    fn lock(&self) -> MutexGuard<'_, Active> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, line: &str) -> Result<(), WriterError> {
        let mut guard = self.lock();
        let active = &mut *guard;

        match active.handle {
            Handle::Closed => return Err(WriterError::Closed),
            Handle::Uninitialized => self.open(active)?,
            Handle::Open(_) => {}
        }

        let incoming = line.len() as u64 + 1;
        let mut rotation = Ok(());
        if active.size > 0 && active.size + incoming > self.max_bytes {
            rotation = self
                .rotate_locked(active)
                .map_err(|err| WriterError::Rotation(Box::new(err)));
        }
        if let Handle::Uninitialized = active.handle {
            self.open(active)?;
        }

        let file = match &mut active.handle {
            Handle::Open(file) => file,
            Handle::Uninitialized | Handle::Closed => return Err(WriterError::Closed),
        };

        let mut buffer = String::with_capacity(line.len() + 1);
        buffer.push_str(line);
        buffer.push('\n');

        match file.write_all(buffer.as_bytes()) {
            Ok(()) => {
                active.size += incoming;
                rotation
            }
            Err(cause) => {
                if let Ok(metadata) = file.metadata() {
                    active.size = metadata.len();
                }
                Err(failed(Op::Write, &self.path)(cause))
            }
        }
    }

    fn open(&self, active: &mut Active) -> Result<(), WriterError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(failed(Op::Open, &self.path))?;
        let size = file
            .metadata()
            .map_err(failed(Op::Open, &self.path))?
            .len();
        active.handle = Handle::Open(file);
        active.size = size;
        Ok(())
    }

    fn rotate_locked(&self, active: &mut Active) -> Result<(), WriterError> {
        let archived = self.path.exists();
        if archived {
            self.shift_archives()?;
        }

        let fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);

        match fresh {
            Ok(file) => {
                active.handle = Handle::Open(file);
                active.size = 0;
                Ok(())
            }
            Err(cause) => {
                // The old handle still points at the archived file; move it
                // back so it stays the active file.
                let restored = archived
                    && self.backup_count > 0
                    && fs::rename(archive_path(&self.path, 1), &self.path).is_ok();
                if !restored {
                    active.handle = Handle::Uninitialized;
                    active.size = 0;
                }
                Err(failed(Op::Open, &self.path)(cause))
            }
        }
    }

    fn shift_archives(&self) -> Result<(), WriterError> {
        if self.backup_count == 0 {
            return fs::remove_file(&self.path).map_err(failed(Op::Delete, &self.path));
        }

        // Shift into the first free slot. The oldest archive is only deleted
        // when every slot is taken, so a chain left with a gap by an earlier
        // failure is not trimmed again.
        let free = (1..=self.backup_count).find(|&index| !archive_path(&self.path, index).exists());
        let top = match free {
            Some(index) => index,
            None => {
                let oldest = archive_path(&self.path, self.backup_count);
                fs::remove_file(&oldest).map_err(failed(Op::Delete, &oldest))?;
                self.backup_count
            }
        };

        for index in (1..top).rev() {
            let from = archive_path(&self.path, index);
            fs::rename(&from, archive_path(&self.path, index + 1))
                .map_err(failed(Op::Rename, &from))?;
        }

        fs::rename(&self.path, archive_path(&self.path, 1)).map_err(failed(Op::Rename, &self.path))
    }

    fn mirror(&self, line: &str) {
        let mut mirror = self.mirror.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(mirror, "{}", line).and_then(|()| mirror.flush());
    }
}

impl Drop for RotatingLogWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
