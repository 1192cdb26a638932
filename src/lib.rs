//! unbundle - deploys embedded native resources and loads dynamic libraries
//!
//! unbundle takes a set of resources embedded in an application bundle
//! (a directory during development, a tar archive when distributed),
//! materializes them into a deployment directory, and optionally loads the
//! dynamic libraries among them so they can be called over FFI.
//!
//! It is built for the hostile case: several processes deploying the same
//! resources to the same directory at the same time. Coordination is a
//! cooperative protocol over one advisory lock file per deployment root plus
//! shared read locks on every deployed file; intact deployments are reused,
//! and live-loaded libraries are pinned so peers cannot delete or corrupt
//! them.
//!
//! ```no_run
//! use unbundle::Deployer;
//!
//! let deployed = Deployer::from("resources/$(OS)/$(ARCH)/*")
//!     .to("vendor/native/$(VERSION)/$(ARCH)")
//!     .load()?;
//! println!("OK!: {}", deployed.deployment_path().display());
//! # Ok::<(), unbundle::DeployError>(())
//! ```

pub mod bundle;
pub mod deployer;
pub mod error;
pub mod fs;
pub mod janitor;
pub mod platform;
pub mod resource;
pub mod template;

mod engine;
mod loader;

// Re-exports for convenience
pub use bundle::{Bundle, Origin};
pub use deployer::{Deployed, Deployer};
pub use error::{DeployError, DeployResult};
pub use loader::pinned_lock_count;
pub use resource::Resource;
