// Copyright 2021 Steven Bosnick
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE-2.0 or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms

//! Locating the compositor socket.
//!
//! The environment decides where the compositor is, checked in this order:
//!
//! 1. `WAYLAND_SOCKET` names a descriptor of an already connected socket.
//! 2. `WAYLAND_DISPLAY` names a socket in `XDG_RUNTIME_DIR` (or, if it is an
//!    absolute path, the socket itself).
//! 3. The socket `wayland-0` in `XDG_RUNTIME_DIR`.
//!
//! Empty variables count as unset.

use std::{
    env,
    ffi::OsString,
    io,
    os::unix::io::{BorrowedFd, FromRawFd, OwnedFd, RawFd},
    path::PathBuf,
};

use rustix::io::{fcntl_getfd, fcntl_setfd, FdFlags};
use snafu::{ResultExt, Snafu};
use tokio::net::UnixStream;

const WAYLAND_SOCKET: &str = "WAYLAND_SOCKET";
const WAYLAND_DISPLAY: &str = "WAYLAND_DISPLAY";
const XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";
const WAYLAND_DEBUG: &str = "WAYLAND_DEBUG";
const DEFAULT_DISPLAY: &str = "wayland-0";

/// Where to find the compositor.
///
/// An `Endpoint` is used up by [`connect`](Endpoint::connect); an inherited
/// socket is owned by the `Endpoint` until then.
#[derive(Debug)]
pub enum Endpoint {
    /// An already connected socket inherited from the parent process.
    Socket(OwnedFd),

    /// The path of the compositor's listening socket.
    Path(PathBuf),
}

/// Where the environment says the compositor is, before anything is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// The descriptor number given in `WAYLAND_SOCKET`.
    Socket(RawFd),

    /// The path of the compositor's listening socket.
    Path(PathBuf),
}

/// The possible errors when locating or connecting to the compositor.
#[derive(Debug, Snafu)]
pub enum ConnectError {
    /// None of the environment variables name a compositor.
    #[snafu(display("No Wayland compositor detected: neither WAYLAND_SOCKET nor XDG_RUNTIME_DIR is set."))]
    NoCompositor,

    /// `WAYLAND_SOCKET` is not an open file descriptor.
    #[snafu(display("WAYLAND_SOCKET is not a valid file descriptor: {:?}", value))]
    InvalidSocketFd {
        /// The value of `WAYLAND_SOCKET`.
        value: OsString,
    },

    /// The socket at `path` could not be connected.
    #[snafu(display("Unable to connect to {}: {}", path.display(), source))]
    Connect {
        /// The socket path.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },

    /// The inherited socket could not be set up for use.
    #[snafu(display("Unable to use the socket from WAYLAND_SOCKET: {}", source))]
    AdoptSocket {
        /// The underlying error.
        source: io::Error,
    },
}

impl Endpoint {
    /// Locate the compositor from the process environment.
    ///
    /// An inherited `WAYLAND_SOCKET` descriptor is taken over here: it is
    /// marked close-on-exec and the variable is removed from the environment,
    /// so a later call falls through to `WAYLAND_DISPLAY`.
    ///
    /// Removing the variable races with other threads reading the environment.
    /// Call this before starting a multi-threaded runtime or any other threads
    /// when `WAYLAND_SOCKET` may be set.
    pub fn from_env() -> Result<Endpoint, ConnectError> {
        match Endpoint::resolve(|key| env::var_os(key))? {
            Location::Socket(raw) => {
                let fd = adopt_fd(raw)?;
                env::remove_var(WAYLAND_SOCKET);
                Ok(Endpoint::Socket(fd))
            }
            Location::Path(path) => Ok(Endpoint::Path(path)),
        }
    }

    /// Locate the compositor using `lookup` to read the environment variables.
    ///
    /// Nothing is opened or taken over; see [`from_env`](Endpoint::from_env)
    /// for that.
    pub fn resolve<F>(lookup: F) -> Result<Location, ConnectError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(value) = lookup(WAYLAND_SOCKET) {
            let fd = value
                .to_str()
                .and_then(|s| s.parse::<RawFd>().ok())
                .filter(|fd| *fd >= 0);

            return match fd {
                Some(fd) => Ok(Location::Socket(fd)),
                None => InvalidSocketFdSnafu { value }.fail(),
            };
        }

        let runtime_dir = lookup(XDG_RUNTIME_DIR).map(PathBuf::from);
        match (lookup(WAYLAND_DISPLAY).map(PathBuf::from), runtime_dir) {
            (Some(display), _) if display.is_absolute() => Ok(Location::Path(display)),
            (Some(display), Some(dir)) => Ok(Location::Path(dir.join(display))),
            (None, Some(dir)) => Ok(Location::Path(dir.join(DEFAULT_DISPLAY))),
            _ => NoCompositorSnafu.fail(),
        }
    }

    /// Open the socket for this endpoint.
    pub async fn connect(self) -> Result<UnixStream, ConnectError> {
        match self {
            Endpoint::Socket(fd) => {
                let stream = std::os::unix::net::UnixStream::from(fd);
                stream.set_nonblocking(true).context(AdoptSocketSnafu)?;
                UnixStream::from_std(stream).context(AdoptSocketSnafu)
            }
            Endpoint::Path(path) => {
                let result = UnixStream::connect(&path).await;
                result.context(ConnectSnafu { path })
            }
        }
    }
}

/// Whether `WAYLAND_DEBUG` asks for client protocol logging.
pub fn debug_enabled<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<OsString>,
{
    lookup(WAYLAND_DEBUG)
        .and_then(|value| value.into_string().ok())
        .map_or(false, |value| value == "1" || value.contains("client"))
}

fn adopt_fd(raw: RawFd) -> Result<OwnedFd, ConnectError> {
    let invalid = || InvalidSocketFdSnafu {
        value: OsString::from(raw.to_string()),
    };

    // Check the descriptor is open before taking ownership of it.
    // SAFETY: the borrow does not outlive this call and fcntl fails cleanly on a
    // closed descriptor.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let flags = fcntl_getfd(borrowed).map_err(|_| invalid().build())?;

    // SAFETY: WAYLAND_SOCKET hands this process the descriptor and it is open.
    // The variable is removed right after so the descriptor is only taken once.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    fcntl_setfd(&fd, flags | FdFlags::CLOEXEC)
        .map_err(io::Error::from)
        .context(AdoptSocketSnafu)?;

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        collections::HashMap,
        io::{Read, Write},
        os::unix::io::IntoRawFd,
    };

    use assert_matches::assert_matches;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn resolve_prefers_wayland_socket() {
        let lookup = env_of(&[
            ("WAYLAND_SOCKET", "7"),
            ("WAYLAND_DISPLAY", "wayland-1"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);

        assert_eq!(Endpoint::resolve(lookup).unwrap(), Location::Socket(7));
    }

    #[test]
    fn resolve_rejects_bad_wayland_socket() {
        let lookup = env_of(&[("WAYLAND_SOCKET", "three"), ("XDG_RUNTIME_DIR", "/run")]);
        assert_matches!(
            Endpoint::resolve(lookup),
            Err(ConnectError::InvalidSocketFd { .. })
        );

        let lookup = env_of(&[("WAYLAND_SOCKET", "-1")]);
        assert_matches!(
            Endpoint::resolve(lookup),
            Err(ConnectError::InvalidSocketFd { .. })
        );
    }

    #[test]
    fn resolve_joins_display_to_runtime_dir() {
        let lookup = env_of(&[
            ("WAYLAND_DISPLAY", "wayland-1"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);

        assert_eq!(
            Endpoint::resolve(lookup).unwrap(),
            Location::Path(PathBuf::from("/run/user/1000/wayland-1"))
        );
    }

    #[test]
    fn resolve_uses_absolute_display_as_is() {
        let lookup = env_of(&[
            ("WAYLAND_DISPLAY", "/tmp/compositor"),
            ("XDG_RUNTIME_DIR", "/run/user/1000"),
        ]);

        assert_eq!(
            Endpoint::resolve(lookup).unwrap(),
            Location::Path(PathBuf::from("/tmp/compositor"))
        );
    }

    #[test]
    fn resolve_falls_back_to_wayland_0() {
        let lookup = env_of(&[("XDG_RUNTIME_DIR", "/run/user/1000")]);

        assert_eq!(
            Endpoint::resolve(lookup).unwrap(),
            Location::Path(PathBuf::from("/run/user/1000/wayland-0"))
        );
    }

    #[test]
    fn resolve_without_runtime_dir_is_no_compositor() {
        assert_matches!(
            Endpoint::resolve(env_of(&[("WAYLAND_DISPLAY", "wayland-1")])),
            Err(ConnectError::NoCompositor)
        );
        assert_matches!(
            Endpoint::resolve(env_of(&[("WAYLAND_SOCKET", ""), ("XDG_RUNTIME_DIR", "")])),
            Err(ConnectError::NoCompositor)
        );
    }

    #[test]
    fn debug_enabled_accepts_one_and_client() {
        assert!(debug_enabled(env_of(&[("WAYLAND_DEBUG", "1")])));
        assert!(debug_enabled(env_of(&[("WAYLAND_DEBUG", "client")])));
        assert!(!debug_enabled(env_of(&[("WAYLAND_DEBUG", "server")])));
        assert!(!debug_enabled(env_of(&[])));
    }

    #[test]
    fn adopt_fd_rejects_closed_descriptor() {
        assert_matches!(
            adopt_fd(1_000_000),
            Err(ConnectError::InvalidSocketFd { .. })
        );
    }

    #[test]
    fn adopt_fd_sets_cloexec() {
        let (ours, _theirs) = std::os::unix::net::UnixStream::pair().unwrap();

        let fd = adopt_fd(ours.into_raw_fd()).expect("unable to adopt descriptor");

        assert!(fcntl_getfd(&fd).unwrap().contains(FdFlags::CLOEXEC));
    }

    #[tokio::test]
    async fn connect_to_path_reaches_listener() {
        let dir = tempfile::tempdir().expect("no tempdir");
        let listener = tokio::net::UnixListener::bind(dir.path().join("wayland-0")).unwrap();
        let lookup = env_of(&[("XDG_RUNTIME_DIR", dir.path().to_str().unwrap())]);

        let endpoint = match Endpoint::resolve(lookup).unwrap() {
            Location::Path(path) => Endpoint::Path(path),
            other => panic!("unexpected location {:?}", other),
        };
        let (stream, accepted) = tokio::join!(endpoint.connect(), listener.accept());

        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn connect_to_missing_path_is_error() {
        let dir = tempfile::tempdir().expect("no tempdir");
        let endpoint = Endpoint::Path(dir.path().join("wayland-9"));

        assert_matches!(endpoint.connect().await, Err(ConnectError::Connect { .. }));
    }

    #[tokio::test]
    async fn connect_uses_inherited_socket() {
        let (ours, mut theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let endpoint = Endpoint::Socket(OwnedFd::from(ours));

        let stream = endpoint.connect().await.expect("unable to use socket");
        theirs.write_all(b"ping").unwrap();
        stream.readable().await.unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(stream.try_read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn inherited_socket_is_closed_with_its_stream() {
        let (ours, mut theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let fd = adopt_fd(ours.into_raw_fd()).expect("unable to adopt descriptor");

        let stream = Endpoint::Socket(fd).connect().await.expect("unable to use socket");
        drop(stream);
        let mut buf = Vec::new();

        assert_eq!(theirs.read_to_end(&mut buf).unwrap(), 0);
    }
}
