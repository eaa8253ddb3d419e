//! Deployment pipeline: upload, build, publish, serve.
//!
//! ## Module Map
//!
//! ```text
//!  shipyard submit ──> ingest.rs ──put repos/{id}/..──> ┌──────────────┐
//!        │                  └──set uploaded, push id──> │ broker.rs    │
//!        │                                              │ (SQLite      │
//!        │                                              │  queue +     │
//!  shipyard worker ──> worker.rs <──pop id───────────── │  status map) │
//!                        │  └──set building/deployed/failed──>         │
//!                        │                              └──────────────┘
//!                        ├─ fetcher.rs    repos/{id}/.. → work_dir/{id}
//!                        ├─ sandbox.rs    BuildExecutor (timeout, cancel)
//!                        │    ├─ docker.rs  container per build (bollard)
//!                        │    └─ local.rs   host process group
//!                        └─ publisher.rs  dist|build|out → builds/{id}/..
//!
//!  shipyard router ──> router.rs   Host abc12.<domain> + path → builds/abc12/path
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                            |
//! |----------|-----------------------------------------------------------|
//! | `models` | `DeploymentId`, `DeploymentStatus`, transition rules      |
//! | `store`  | `ObjectStore` trait, on-disk and in-memory backends       |
//! | `s3`     | S3-compatible bucket backend (`object_store`)             |

pub mod broker;
pub mod docker;
pub mod fetcher;
pub mod ingest;
pub mod local;
pub mod models;
pub mod publisher;
pub mod router;
pub mod s3;
pub mod sandbox;
pub mod store;
pub mod worker;
