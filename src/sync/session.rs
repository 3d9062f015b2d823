//! SFTP-backed file transfer session.
//!
//! The session dials the locally forwarded tunnel endpoint and
//! authenticates with the build pod's per-cycle password. Host identity is
//! not verified: the endpoint is an ephemeral pod reached over a local
//! forward, and the credential is minted fresh each provisioning cycle.
//! The forwarded port often refuses connections for a moment after the
//! tunnel reports readiness, so the dial is retried a fixed number of
//! times before giving up.

use std::fs::File;
use std::io;
use std::net::TcpStream;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use ssh2::{ErrorCode, Session, Sftp};

use crate::sync::SyncError;
use crate::sync::target::RemoteEntry;

/// SFTP status code for a path that does not exist.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Remote filesystem operations the mirror drives.
///
/// Implementations report walk entries relative to the walk root with
/// slash-normalised paths, parents before children.
pub trait FileTransfer {
    /// Creates `path` and any missing parents; existing directories are
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the directory cannot be created.
    fn ensure_dir(&self, path: &Utf8Path) -> Result<(), SyncError>;

    /// Returns the modification time of `path`, or `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] for failures other than absence.
    fn modified(&self, path: &Utf8Path) -> Result<Option<SystemTime>, SyncError>;

    /// Uploads `local` to `remote`, replacing any existing content.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when either side of the copy fails.
    fn upload(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<(), SyncError>;

    /// Removes a file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the removal fails.
    fn remove_file(&self, path: &Utf8Path) -> Result<(), SyncError>;

    /// Removes an empty directory.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the removal fails.
    fn remove_dir(&self, path: &Utf8Path) -> Result<(), SyncError>;

    /// Walks the tree rooted at `root` depth-first.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the walk cannot be completed.
    fn walk(&self, root: &Utf8Path) -> Result<Vec<RemoteEntry>, SyncError>;
}

/// Connection parameters for the forwarded SFTP endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectSettings {
    /// Host the tunnel listens on, normally loopback.
    pub host: String,
    /// Local port the tunnel forwards.
    pub port: u16,
    /// SFTP account configured in the build pod.
    pub user: String,
    /// Credential returned by the provisioner.
    pub password: String,
    /// Dial attempts before giving up.
    pub attempts: u32,
    /// Pause between dial attempts.
    pub retry_delay: Duration,
}

/// Live SFTP session over the tunnel.
pub struct SftpSession {
    sftp: Sftp,
    _session: Session,
}

impl SftpSession {
    /// Connects and authenticates, retrying the dial up to the configured
    /// attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConnectExhausted`] once the budget is spent.
    pub fn connect(settings: &ConnectSettings) -> Result<Self, SyncError> {
        let mut last_error = String::new();
        for attempt in 1..=settings.attempts {
            match Self::try_connect(settings) {
                Ok(session) => return Ok(session),
                Err(message) => {
                    last_error = message;
                    if attempt < settings.attempts {
                        std::thread::sleep(settings.retry_delay);
                    }
                }
            }
        }

        Err(SyncError::ConnectExhausted {
            attempts: settings.attempts,
            message: last_error,
        })
    }

    fn try_connect(settings: &ConnectSettings) -> Result<Self, String> {
        let stream = TcpStream::connect((settings.host.as_str(), settings.port))
            .map_err(|err| err.to_string())?;
        let mut session = Session::new().map_err(|err| err.to_string())?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|err| err.to_string())?;
        session
            .userauth_password(&settings.user, &settings.password)
            .map_err(|err| err.to_string())?;
        let sftp = session.sftp().map_err(|err| err.to_string())?;

        Ok(Self {
            sftp,
            _session: session,
        })
    }

    fn walk_into(
        &self,
        root: &Utf8Path,
        relative: &Utf8Path,
        out: &mut Vec<RemoteEntry>,
    ) -> Result<(), SyncError> {
        let dir = root.join(relative);
        let listing = self
            .sftp
            .readdir(dir.as_std_path())
            .map_err(|err| remote_error("list directory", &dir, &err))?;

        for (path, stat) in listing {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| SyncError::NonUtf8Path {
                    path: path.to_string_lossy().into_owned(),
                })?;
            let entry_path = relative.join(name);
            let is_dir = stat.is_dir();
            out.push(RemoteEntry {
                path: entry_path.clone(),
                is_dir,
                modified: stat.mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
            });
            if is_dir {
                self.walk_into(root, &entry_path, out)?;
            }
        }
        Ok(())
    }
}

impl FileTransfer for SftpSession {
    fn ensure_dir(&self, path: &Utf8Path) -> Result<(), SyncError> {
        let mut current = Utf8PathBuf::new();
        for component in path.components() {
            current.push(component.as_str());
            if self.sftp.stat(current.as_std_path()).is_ok() {
                continue;
            }
            self.sftp
                .mkdir(current.as_std_path(), 0o755)
                .map_err(|err| remote_error("create directory", &current, &err))?;
        }
        Ok(())
    }

    fn modified(&self, path: &Utf8Path) -> Result<Option<SystemTime>, SyncError> {
        match self.sftp.stat(path.as_std_path()) {
            Ok(stat) => Ok(stat.mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs))),
            Err(err) if is_absent(&err) => Ok(None),
            Err(err) => Err(remote_error("stat", path, &err)),
        }
    }

    fn upload(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<(), SyncError> {
        let mut source = File::open(local).map_err(|err| SyncError::LocalIo {
            path: local.to_owned(),
            message: err.to_string(),
        })?;
        let mut destination = self
            .sftp
            .create(remote.as_std_path())
            .map_err(|err| remote_error("create file", remote, &err))?;
        io::copy(&mut source, &mut destination).map_err(|err| SyncError::RemoteIo {
            operation: String::from("write file"),
            path: remote.to_owned(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<(), SyncError> {
        self.sftp
            .unlink(path.as_std_path())
            .map_err(|err| remote_error("remove file", path, &err))
    }

    fn remove_dir(&self, path: &Utf8Path) -> Result<(), SyncError> {
        self.sftp
            .rmdir(path.as_std_path())
            .map_err(|err| remote_error("remove directory", path, &err))
    }

    fn walk(&self, root: &Utf8Path) -> Result<Vec<RemoteEntry>, SyncError> {
        let mut entries = Vec::new();
        self.walk_into(root, Utf8Path::new(""), &mut entries)?;
        Ok(entries)
    }
}

fn is_absent(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(code) if code == SFTP_NO_SUCH_FILE)
}

fn remote_error(operation: &str, path: &Utf8Path, err: &ssh2::Error) -> SyncError {
    SyncError::RemoteIo {
        operation: operation.to_owned(),
        path: path.to_owned(),
        message: err.to_string(),
    }
}
