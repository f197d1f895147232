use crate::PfsError;
use std::net::SocketAddr;
use std::path::Path;

/// The address-list config file shared by every component: line 0 is the
/// metadata service, lines 1..N are the file services in stripe-index
/// order. Blank lines and `#`-prefixed comments are ignored.
#[derive(Debug, Clone)]
pub struct ServerList {
    metaserver: String,
    fileservers: Vec<String>,
}

impl ServerList {
    pub fn new(metaserver: String, fileservers: Vec<String>) -> Self {
        Self {
            metaserver,
            fileservers,
        }
    }

    pub fn from_str(contents: &str) -> Result<Self, PfsError> {
        let mut lines = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));

        let metaserver = lines
            .next()
            .ok_or_else(|| PfsError::InvalidArgument("empty server list".into()))?
            .to_string();
        let fileservers: Vec<String> = lines.map(str::to_string).collect();

        if fileservers.is_empty() {
            return Err(PfsError::InvalidArgument(
                "server list has no file servers".into(),
            ));
        }

        Ok(Self {
            metaserver,
            fileservers,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PfsError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PfsError::InvalidArgument(format!("reading server list: {e}")))?;
        Self::from_str(&contents)
    }

    pub fn metaserver(&self) -> &str {
        &self.metaserver
    }

    pub fn fileserver(&self, index: u32) -> Option<&str> {
        self.fileservers.get(index as usize).map(String::as_str)
    }

    pub fn fileservers(&self) -> &[String] {
        &self.fileservers
    }

    /// `N`, the number of file services, the upper bound on stripe width.
    pub fn width(&self) -> u32 {
        self.fileservers.len() as u32
    }
}

/// The `host:port` a service binds. List entries are the URIs clients dial,
/// so an `http://` scheme prefix is stripped before parsing.
pub fn bind_addr(addr: &str) -> Result<SocketAddr, PfsError> {
    let hostport = addr
        .strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr);
    hostport
        .trim_end_matches('/')
        .parse()
        .map_err(|e| PfsError::InvalidArgument(format!("bad server address {addr}: {e}")))
}
