use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::info;

use crate::{
    config::{self, Settings, Sources},
    image_tests::FailurePolicy,
    layout::Layout,
    package,
    pipeline::{self, Pipeline, Step},
    process::SystemRunner,
    Result,
};

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: GlobalArgs,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Directory holding the Dockerfile, the `scripts` directory and the `tests/cases` directory.
    #[arg(long = "project-dir", global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Directory holding the `*.tgz` release archives. Defaults to `<project-dir>/releases`.
    #[arg(long = "releases-dir", global = true)]
    releases_dir: Option<PathBuf>,

    /// Directory receiving all generated files. Defaults to `<project-dir>/build`.
    #[arg(long = "build-dir", global = true)]
    build_dir: Option<PathBuf>,

    /// Override a configuration property, e.g. `-P solr.docker.imageTag=latest`. Takes precedence
    /// over the corresponding environment variable.
    #[arg(
        short = 'P',
        long = "property",
        global = true,
        value_name = "KEY=VALUE",
        value_parser = config::parse_override,
    )]
    properties: Vec<(String, String)>,

    /// The product version. Inferred from the release archive names when absent.
    #[arg(long = "solr-version", global = true)]
    solr_version: Option<String>,

    /// Run every step even if its inputs did not change since its last successful run.
    #[arg(long, global = true)]
    rerun: bool,

    /// After a failure, continue with the steps that do not depend on the failed one.
    #[arg(long = "keep-going", global = true)]
    keep_going: bool,

    /// What to do when a test case fails.
    #[arg(long = "test-failures", global = true, value_enum, default_value_t)]
    test_failures: FailurePolicy,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Produce the build context archive
    Package,
    /// Build the image
    Build,
    /// Tag the built image
    Tag,
    /// Run the image test cases
    Test,
    /// Push the tagged image
    Push,
    /// Build and tag the image
    Docker,
    /// Run several steps in one invocation, e.g. `run test push`
    #[command(arg_required_else_help = true)]
    Run {
        #[arg(value_enum, required = true)]
        steps: Vec<Step>,
    },
    /// Print the resolved configuration and where every value came from
    Config,
}

impl Commands {
    /// The steps requested by this command, if it runs any.
    fn steps(&self) -> Option<Vec<Step>> {
        Some(match self {
            Commands::Package => vec![Step::Package],
            Commands::Build => vec![Step::Build],
            Commands::Tag => vec![Step::Tag],
            Commands::Test => vec![Step::Test],
            Commands::Push => vec![Step::Push],
            Commands::Docker => vec![Step::Build, Step::Tag],
            Commands::Run { steps } => steps.clone(),
            Commands::Config => return None,
        })
    }
}

impl GlobalArgs {
    fn layout(&self) -> Layout {
        let project_dir = &self.project_dir;
        Layout::new(
            project_dir.clone(),
            self.releases_dir
                .clone()
                .unwrap_or_else(|| project_dir.join("releases")),
            self.build_dir
                .clone()
                .unwrap_or_else(|| project_dir.join("build")),
        )
    }

    fn version(&self, layout: &Layout) -> Result<String> {
        if let Some(version) = &self.solr_version {
            return Ok(version.clone());
        }
        let archives = package::release_archives(&layout.releases_dir)?;
        let version = config::infer_version(
            archives
                .iter()
                .filter_map(|path| path.file_name()?.to_str()),
        )?;
        info!("Inferred version {version} from {:?}", layout.releases_dir);
        Ok(version)
    }

    fn settings(&self, layout: &Layout) -> Result<Settings> {
        let sources = Sources::from_process(self.properties.iter().cloned().collect());
        Ok(Settings::resolve(&sources, &self.version(layout)?))
    }

    fn pipeline_options(&self) -> pipeline::Options {
        pipeline::Options {
            rerun: self.rerun,
            keep_going: self.keep_going,
            test_failures: self.test_failures,
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let layout = self.options.layout();
        let settings = self.options.settings(&layout)?;

        let Some(steps) = self.command.steps() else {
            println!("{}", settings.table());
            return Ok(());
        };

        let mut pipeline = Pipeline::new(
            &layout,
            &settings,
            &SystemRunner,
            self.options.pipeline_options(),
        )?;
        let result = pipeline.run(&steps);
        info!("Summary:\n{}", pipeline.summary());
        result
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn commands_map_to_steps() {
        fn steps(args: &[&str]) -> Option<Vec<Step>> {
            Cli::try_parse_from(["solr-docker"].iter().chain(args))
                .unwrap()
                .command
                .steps()
        }

        assert_eq!(steps(&["docker"]), Some(vec![Step::Build, Step::Tag]));
        assert_eq!(
            steps(&["run", "test", "push"]),
            Some(vec![Step::Test, Step::Push])
        );
        assert_eq!(steps(&["config"]), None);
        assert!(Cli::try_parse_from(["solr-docker", "run", "deploy"]).is_err());
    }

    #[test]
    fn global_options() {
        let cli = Cli::try_parse_from([
            "solr-docker",
            "push",
            "--project-dir",
            "solr/docker",
            "-P",
            "solr.docker.imageTag=latest",
            "--property=solr.docker.tests.include=demo,gosu",
            "--keep-going",
            "--test-failures",
            "run-all",
        ])
        .unwrap();

        assert_eq!(
            cli.options.properties,
            [
                ("solr.docker.imageTag".to_owned(), "latest".to_owned()),
                (
                    "solr.docker.tests.include".to_owned(),
                    "demo,gosu".to_owned()
                ),
            ]
        );
        let options = cli.options.pipeline_options();
        assert!(options.keep_going);
        assert!(!options.rerun);
        assert_eq!(options.test_failures, FailurePolicy::RunAll);

        let layout = cli.options.layout();
        assert_eq!(layout.project_dir, Path::new("solr/docker"));
        assert_eq!(layout.releases_dir, Path::new("solr/docker/releases"));
        assert_eq!(layout.build_dir, Path::new("solr/docker/build"));
    }

    #[test]
    fn malformed_property_is_rejected() {
        assert!(Cli::try_parse_from(["solr-docker", "build", "-P", "imageTag"]).is_err());
    }

    #[test]
    fn version_is_inferred_from_release_archives() {
        let dir = tempfile::tempdir().unwrap();
        let releases = dir.path().join("releases");
        std::fs::create_dir(&releases).unwrap();
        std::fs::write(releases.join("solr-9.5.0.tgz"), "").unwrap();
        std::fs::write(releases.join("solr-9.5.0-slim.tgz"), "").unwrap();

        let project_dir = dir.path().to_str().unwrap();
        let cli = Cli::try_parse_from(["solr-docker", "config", "--project-dir", project_dir])
            .unwrap();
        let layout = cli.options.layout();
        assert_eq!(cli.options.version(&layout).unwrap(), "9.5.0");

        let cli = Cli::try_parse_from([
            "solr-docker",
            "config",
            "--project-dir",
            project_dir,
            "--solr-version",
            "10.0.0",
        ])
        .unwrap();
        assert_eq!(cli.options.version(&layout).unwrap(), "10.0.0");

        std::fs::write(releases.join("solr-9.4.1.tgz"), "").unwrap();
        let cli = Cli::try_parse_from(["solr-docker", "build", "--project-dir", project_dir])
            .unwrap();
        assert!(cli.options.version(&layout).is_err());
    }
}
