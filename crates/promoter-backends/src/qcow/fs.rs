//! Filesystem access to the qcow image tree.
//!
//! [`SftpFs`] talks to a remote server over one SSH session, [`LocalFs`]
//! works on the local disk and is used for staging and tests. Both are
//! blocking and meant to run inside `spawn_blocking`.

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{ErrorCode, Session, Sftp};
use tracing::debug;

use promoter_core::{expand_home, PromoterError, PromoterResult, QcowServer};

/// SFTP status code for a missing file.
const SFTP_NO_SUCH_FILE: i32 = 2;
const KEEPALIVE_INTERVAL_SECS: u32 = 30;

/// Operations the qcow promoter needs on the image tree.
pub trait RemoteFs: Send {
    /// Fails when `path` does not exist.
    fn stat(&mut self, path: &Path) -> io::Result<()>;

    /// Entry names in `path`, sorted.
    fn list_dir(&mut self, path: &Path) -> io::Result<Vec<String>>;

    /// Where the symlink `path` points, `None` when it does not exist.
    fn read_link(&mut self, path: &Path) -> io::Result<Option<PathBuf>>;

    fn remove(&mut self, path: &Path) -> io::Result<()>;

    /// Create `link` pointing at `target`.
    fn symlink(&mut self, target: &Path, link: &Path) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The local filesystem.
#[derive(Debug, Default)]
pub struct LocalFs;

impl RemoteFs for LocalFs {
    fn stat(&mut self, path: &Path) -> io::Result<()> {
        std::fs::metadata(path).map(|_| ())
    }

    fn list_dir(&mut self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_link(&mut self, path: &Path) -> io::Result<Option<PathBuf>> {
        match std::fs::read_link(path) {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }
}

/// A persistent SFTP session.
pub struct SftpFs {
    session: Session,
    sftp: Sftp,
}

fn ssh_error(host: &str, e: ssh2::Error) -> PromoterError {
    PromoterError::Promotion(format!("ssh session to {host}: {e}"))
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

impl SftpFs {
    /// Connect with public key auth. `timeout` bounds the TCP connect and
    /// every blocking session call; keepalives are sent while idle.
    pub fn connect(server: &QcowServer, timeout: Duration) -> PromoterResult<Self> {
        let host = server.host.as_str();
        let addr = (host, server.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PromoterError::Promotion(format!("unable to resolve {host}")))?;
        let tcp = TcpStream::connect_timeout(&addr, timeout)?;

        let mut session = Session::new().map_err(|e| ssh_error(host, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| ssh_error(host, e))?;
        session.set_keepalive(true, KEEPALIVE_INTERVAL_SECS);

        let user = server
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        let key = expand_home(server.keypath.as_deref().unwrap_or("~/.ssh/id_rsa"));
        debug!(host = %host, user = %user, key = %key.display(), "Connecting to qcow server");
        session
            .userauth_pubkey_file(&user, None, &key, None)
            .map_err(|e| ssh_error(host, e))?;
        if !session.authenticated() {
            return Err(PromoterError::Promotion(format!(
                "authentication to {host} as {user} failed"
            )));
        }

        let sftp = session.sftp().map_err(|e| ssh_error(host, e))?;
        Ok(Self { session, sftp })
    }
}

impl RemoteFs for SftpFs {
    fn stat(&mut self, path: &Path) -> io::Result<()> {
        self.sftp.stat(path).map(|_| ()).map_err(io::Error::from)
    }

    fn list_dir(&mut self, path: &Path) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = self
            .sftp
            .readdir(path)
            .map_err(io::Error::from)?
            .into_iter()
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_link(&mut self, path: &Path) -> io::Result<Option<PathBuf>> {
        match self.sftp.readlink(path) {
            Ok(target) => Ok(Some(target)),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        self.sftp.unlink(path).map_err(io::Error::from)
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> io::Result<()> {
        self.sftp.symlink(target, link).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        self.session
            .disconnect(None, "promotion finished", None)
            .map_err(io::Error::from)
    }
}
