//! CLI command implementations.
//!
//! | Module       | Commands handled              |
//! |--------------|-------------------------------|
//! | `serve`      | `Worker`, `Router`            |
//! | `deployment` | `Submit`, `Enqueue`, `Status` |

pub mod deployment;
pub mod serve;

pub use deployment::{cmd_enqueue, cmd_status, cmd_submit};
pub use serve::{cmd_router, cmd_worker};

use std::sync::Arc;

use anyhow::Result;

use shipyard::config::ShipyardConfig;
use shipyard::deploy::broker::SqliteBroker;
use shipyard::deploy::store::{ObjectStore, open_store};

/// Open the configured object store and broker database.
fn open_backends(config: &ShipyardConfig) -> Result<(Arc<dyn ObjectStore>, SqliteBroker)> {
    let store = open_store(&config.store)?;
    let broker = SqliteBroker::open(&config.queue.database)?;
    Ok((store, broker))
}
