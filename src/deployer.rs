//! Fluent construction of deployments
//!
//! ```no_run
//! use unbundle::Deployer;
//!
//! let deployed = Deployer::from("resources/$(OS)/$(ARCH)/*")
//!     .to("vendor/native/$(VERSION)/$(ARCH)")
//!     .load()?;
//! println!("deployed to {}", deployed.deployment_path().display());
//! # Ok::<(), unbundle::DeployError>(())
//! ```
//!
//! `from` and `to` are both mandatory; every other option defaults to the
//! conservative choice. Option validation happens in [`Deployer::load`] so
//! construction stays infallible and order-insensitive.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bundle::Bundle;
use crate::engine::{Engine, EngineOptions};
use crate::error::{DeployError, DeployResult};
use crate::resource::{self, SourcePattern};
use crate::template;

/// Builder for one deployment run.
#[derive(Debug, Default)]
pub struct Deployer {
    bundle: Option<Bundle>,
    resource_template: Option<String>,
    deployment_template: Option<String>,
    options: Options,
}

#[derive(Debug, Clone)]
struct Options {
    always_overwrite: bool,
    reuse_partially_deployed: bool,
    should_load_libraries: bool,
    random_fallback_subdirectory: bool,
    library_suffix: Option<String>,
    retry_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            always_overwrite: false,
            reuse_partially_deployed: false,
            should_load_libraries: true,
            random_fallback_subdirectory: false,
            library_suffix: None,
            retry_timeout: None,
        }
    }
}

impl Deployer {
    /// Start from a resource path template, reading from the default bundle
    /// (the directory containing the current executable).
    pub fn from(resource_path_template: impl Into<String>) -> Deployer {
        Deployer {
            resource_template: Some(resource_path_template.into()),
            ..Deployer::default()
        }
    }

    /// Start from a resource path template read out of an explicit bundle.
    pub fn from_bundle(bundle: Bundle, resource_path_template: impl Into<String>) -> Deployer {
        Deployer {
            bundle: Some(bundle),
            resource_template: Some(resource_path_template.into()),
            ..Deployer::default()
        }
    }

    /// Set the deployment path template (absolute or relative).
    pub fn to(mut self, deployment_path_template: impl Into<String>) -> Deployer {
        self.deployment_template = Some(deployment_path_template.into());
        self
    }

    /// Skip the verify fast-path and always rewrite every file.
    pub fn always_overwrite(mut self, enabled: bool) -> Deployer {
        self.options.always_overwrite = enabled;
        self
    }

    /// Keep read locks on already-verified files across the verify retries
    /// and into the deploy phase, so a partial peer deployment is completed
    /// instead of redone. Incompatible with [`Deployer::always_overwrite`].
    pub fn reuse_partially_deployed(mut self, enabled: bool) -> Deployer {
        self.options.reuse_partially_deployed = enabled;
        self
    }

    /// Load deployed dynamic libraries into the process (default true).
    pub fn should_load_libraries(mut self, enabled: bool) -> Deployer {
        self.options.should_load_libraries = enabled;
        self
    }

    /// For an absolute deployment path, also try a random subdirectory when
    /// the path itself is unusable. The base is registered for exit-time
    /// sweeping of such subdirectories.
    pub fn try_random_fallback_subdirectory(mut self, enabled: bool) -> Deployer {
        self.options.random_fallback_subdirectory = enabled;
        self
    }

    /// Rename deployed libraries by inserting `suffix` before the extension;
    /// on non-Windows this also patches the library's embedded
    /// self-reference. Must be non-empty.
    pub fn add_library_suffix(mut self, suffix: impl Into<String>) -> Deployer {
        self.options.library_suffix = Some(suffix.into());
        self
    }

    /// Override the size-derived lock/verify retry timeout.
    pub fn retry_timeout(mut self, timeout: Duration) -> Deployer {
        self.options.retry_timeout = Some(timeout);
        self
    }

    /// Enumerate, deploy and (optionally) load, returning the handle with
    /// the paths that were actually used.
    pub fn load(self) -> DeployResult<Deployed> {
        let resource_template = self.resource_template.as_deref().ok_or_else(|| {
            DeployError::config("resource path is not set, use from(resource_path_template)")
        })?;
        let deployment_template = self.deployment_template.as_deref().ok_or_else(|| {
            DeployError::config("deployment path is not set, use to(deployment_path_template)")
        })?;
        if self.options.always_overwrite && self.options.reuse_partially_deployed {
            return Err(DeployError::config(
                "always_overwrite is not compatible with reuse_partially_deployed",
            ));
        }
        if self.options.library_suffix.as_deref() == Some("") {
            return Err(DeployError::config("library suffix must not be empty"));
        }

        let bundle = self.bundle.unwrap_or_else(Bundle::for_current_exe);

        let source = template::expand_source(resource_template, bundle.version())?;
        let pattern = SourcePattern::parse(&source)?;
        let resources = resource::enumerate(
            &bundle,
            &pattern,
            self.options.library_suffix.as_deref(),
        )?;

        let destination = template::expand_destination(deployment_template, bundle.version())?;

        let mut engine = Engine::new(
            bundle,
            resources,
            EngineOptions {
                always_overwrite: self.options.always_overwrite,
                reuse_partially_deployed: self.options.reuse_partially_deployed,
                should_load_libraries: self.options.should_load_libraries,
                random_fallback_subdirectory: self.options.random_fallback_subdirectory,
                library_suffix: self.options.library_suffix.clone(),
                retry_timeout: self.options.retry_timeout,
            },
        );
        let deployment_path = engine.load(&destination)?;

        Ok(Deployed {
            deployment_path,
            resource_path: pattern.display(),
        })
    }
}

/// Handle returned by a successful [`Deployer::load`].
#[derive(Debug, Clone)]
pub struct Deployed {
    deployment_path: PathBuf,
    resource_path: String,
}

impl Deployed {
    /// The root the resources were actually deployed to.
    pub fn deployment_path(&self) -> &Path {
        &self.deployment_path
    }

    /// The expanded resource pattern that was enumerated.
    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }
}
