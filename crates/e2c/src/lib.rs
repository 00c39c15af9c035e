#![forbid(unsafe_code)]
//! e2c public API facade.
//!
//! Re-exports path resolution from `e2c-core`. A `cat`-style front end maps
//! the image, calls [`resolve_path`], and treats `Ok(None)` as "no such file":
//!
//! ```no_run
//! let image = std::fs::read("disk.img").expect("read image");
//! match e2c::resolve_path(&image, "/etc/motd") {
//!     Ok(Some(ino)) => println!("inode {ino}"),
//!     Ok(None) => eprintln!("/etc/motd: no such file"),
//!     Err(e) => std::process::exit(e.to_errno()),
//! }
//! ```

pub use e2c_core::*;
