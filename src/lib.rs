//! # Leaktrace
//!
//! Facade over the Leaktrace crates. The core pipeline is re-exported at the top level;
//! sources and exporters are enabled through features:
//!
//! | Feature       | Crate                   |
//! |---------------|-------------------------|
//! | `tracergrind` | `leaktrace-tracergrind` |
//! | `scripted`    | `leaktrace-scripted`    |
//! | `columnar`    | `leaktrace-columnar`    |
//! | `daredevil`   | `leaktrace-daredevil`   |

pub use leaktrace_core::*;

#[cfg(feature = "scripted")]
pub use leaktrace_scripted as scripted;
#[cfg(feature = "tracergrind")]
pub use leaktrace_tracergrind as tracergrind;

#[cfg(feature = "columnar")]
pub use leaktrace_columnar as columnar;
#[cfg(feature = "daredevil")]
pub use leaktrace_daredevil as daredevil;
