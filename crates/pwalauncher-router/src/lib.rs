//! Segment-trie route table for the gateway.
//!
//! Mounts are registered once at startup under a path prefix made of whole
//! segments (`/8081`, `/v1`, `/api/v2`). Lookup walks the request path one
//! segment at a time and returns the longest registered prefix together with
//! the remainder of the path that should be forwarded upstream.

pub mod trie;

pub use trie::{Mount, MountKind, RouteMatch, RouteTable, RouteTableBuilder, RouteTableError};
