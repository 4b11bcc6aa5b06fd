//! relay - declarative workflow engine
//!
//! relay executes multi-step automations described in YAML flow documents.
//! A flow declares an ordered list of steps, each invoking a named connector
//! action; inputs reference earlier outputs, flow inputs, environment
//! variables, and secrets through `${{ ... }}` expressions.
//!
//! ## Example
//!
//! ```yaml
//! name: release-notes
//! description: Fetch the latest release and announce it
//!
//! input:
//!   properties:
//!     repo:
//!       type: string
//!       required: true
//!
//! steps:
//!   - name: fetch
//!     connector: http
//!     action: request
//!     input:
//!       url: "https://api.github.com/repos/${{ input.repo }}/releases/latest"
//!
//!   - name: announce
//!     connector: log
//!     action: print
//!     when: ${{ steps.fetch.output.status_code == "200" }}
//!     input:
//!       message: "new release: ${{ steps.fetch.output.body.tag_name }}"
//! ```

pub mod connectors;
pub mod engine;
pub mod error;
pub mod flow;
pub mod server;

pub use error::{Error, Result};
