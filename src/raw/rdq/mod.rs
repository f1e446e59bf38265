//! RDQ, the reference digitizer format.
//!
//! A file is a header (see [`header`]) followed by length-delimited records (see
//! [`record`]). All integers are little-endian.

/// Header parsing and encoding.
pub mod header;
/// Record framing and payloads.
pub mod record;
/// Synthetic runs.
pub mod simulate;
/// The RDQ [`DataStreamer`](crate::raw::DataStreamer).
pub mod streamer;
/// RDQ encoder.
pub mod writer;

pub use header::{ChannelInfo, RdqHeader};
pub use record::{EventRecord, StatusRecord, STATUS_STREAM};
pub use simulate::{simulate_to_path, SimulationSpec};
pub use streamer::RdqStreamer;
pub use writer::RdqWriter;

use std::io::{self, Read};

/// Registry name of the format.
pub const FORMAT_NAME: &str = "rdq";
/// Extension recognised by the format registry.
pub const FILE_EXTENSION: &str = "rdq";

/// Fills `buf` from `reader` until it is full or the reader is exhausted. Returns the
/// number of bytes read.
pub(crate) fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
