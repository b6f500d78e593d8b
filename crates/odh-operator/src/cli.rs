//! Command line handling using the `clap` crate.
//!
//! ```no_run
//! use clap::Parser;
//! use odh_operator::cli::{self, Command};
//!
//! # fn main() -> Result<(), cli::Error> {
//! match Command::<cli::RunArguments>::parse() {
//!     Command::Crd => cli::print_crds()?,
//!     Command::Run(args) => {
//!         let release = args.release();
//!         // Start the controllers
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::io::Write;

use clap::{Args, Parser};
use kube::CustomResourceExt;
use semver::Version;
use snafu::{ResultExt, Snafu};

use crate::{
    client::DeletePropagation,
    feature::tracker::FeatureTracker,
    release::{Platform, Release},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {name:?}"))]
    SerializeCrd {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to write to stdout"))]
    WriteStdout { source: std::io::Error },
}

/// The commands every operator binary supports.
///
/// Generic over the arguments of [`Command::Run`], so that binaries can add
/// their own flags next to [`RunArguments`].
#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(Run),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// The namespace the operator is running in.
    ///
    /// When running on Kubernetes, project it with the downward API into the
    /// `OPERATOR_NAMESPACE` env variable.
    #[arg(long, env)]
    pub operator_namespace: String,

    /// The namespace components are deployed to. Also prefixes the names of
    /// feature trackers.
    #[arg(long, env, default_value = "opendatahub")]
    pub applications_namespace: String,

    /// The platform flavour stamped onto every managed object.
    #[arg(long, env, value_enum, default_value_t = Platform::OpenDataHub)]
    pub platform: Platform,

    /// The release version stamped onto every managed object.
    #[arg(long, env, default_value = "0.0.0")]
    pub platform_version: Version,

    /// How dependents of garbage collected objects are deleted.
    #[arg(long, env, value_enum, default_value_t = DeletePropagation::Foreground)]
    pub gc_propagation_policy: DeletePropagation,

    /// The field manager used for server-side apply.
    #[arg(long, env, default_value = "opendatahub-operator")]
    pub field_manager: String,
}

impl RunArguments {
    pub fn release(&self) -> Release {
        Release::new(self.platform, self.platform_version.clone())
    }
}

/// Prints the CRDs owned by this crate as a multi-document YAML stream.
pub fn print_crds() -> Result<(), Error> {
    let mut stdout = std::io::stdout().lock();
    write_crds(&mut stdout)
}

fn write_crds(out: &mut impl Write) -> Result<(), Error> {
    let crd = FeatureTracker::crd();
    let yaml = serde_yaml::to_string(&crd).context(SerializeCrdSnafu {
        name: FeatureTracker::crd_name(),
    })?;
    writeln!(out, "---\n{}", yaml.trim_end()).context(WriteStdoutSnafu)
}
