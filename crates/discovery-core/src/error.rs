use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("cannot bind discovery port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("shared folder scan failed: {0:#}")]
    Scan(#[from] anyhow::Error),
}
