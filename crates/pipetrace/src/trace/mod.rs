//! Call recorder and trace stream.
//!
//! A trace is one XML document:
//!
//! ```text
//! <?xml version='1.0' encoding='UTF-8'?>
//! <?xml-stylesheet type='text/xsl' href='trace.xsl'?>
//! <trace version='0.1'>
//!     <call no='0' class='pipe_screen' method='context_create'>
//!         <arg name='screen'><ptr>0x1</ptr></arg><ret><ptr>0x2</ptr></ret>
//!     </call>
//! </trace>
//! ```
//!
//! (each `<call>` is written on a single line).

mod value;
mod writer;

use std::path::PathBuf;

pub(crate) use value::escape_into;
pub use value::TraceValue;
pub use writer::{CallRecord, TraceWriter};

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to open trace file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("trace stream i/o error: {0}")]
    Io(#[from] std::io::Error),
}
