pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{read_stream, seeded_bytes};
