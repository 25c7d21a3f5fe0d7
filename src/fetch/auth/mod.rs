mod header;

pub use header::HeaderAuth;
