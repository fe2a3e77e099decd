//! # rxfer – transfer engine
//!
//! Connection lifecycle, pooling and transfer scheduling for remote
//! file-transfer endpoints (SFTP, FTP, FTPS):
//!   • One supervised logical connection per endpoint, with auto-reconnect
//!   • A bounded pool of extra sessions per endpoint for parallel transfers
//!   • A transfer queue drained by a bounded set of concurrent workers
//!   • Recursive upload / download / bidirectional directory sync
//!
//! The wire protocols themselves are supplied by the caller through the
//! [`xfer::RemoteSession`] and [`xfer::SessionFactory`] traits.

pub mod xfer;
