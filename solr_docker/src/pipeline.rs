use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Table};
use image_ref::{ImageId, ImageName};
use log::{error, info, warn};

use crate::{
    config::Settings,
    docker,
    fingerprint::{Fingerprint, Fingerprinter},
    image_tests::{self, FailurePolicy, Selection, TestRun},
    layout::{self, Layout},
    package::{self, ContextArchive, PackageInputs},
    process::Runner,
    state::StateStore,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Step {
    /// Produce the build context archive.
    Package,
    /// Build the image from the build context.
    Build,
    /// Tag the built image with the configured image name.
    Tag,
    /// Run the image test cases.
    Test,
    /// Push the tagged image to its registry.
    Push,
}

impl Step {
    pub const fn name(self) -> &'static str {
        match self {
            Step::Package => "package",
            Step::Build => "build",
            Step::Tag => "tag",
            Step::Test => "test",
            Step::Push => "push",
        }
    }

    /// Steps that must have succeeded before this one can run.
    pub const fn depends_on(self) -> &'static [Step] {
        match self {
            Step::Package => &[],
            Step::Build => &[Step::Package],
            Step::Tag | Step::Test => &[Step::Build],
            Step::Push => &[Step::Tag],
        }
    }

    /// Steps that, when they are part of the same run, must have finished before this one starts,
    /// whatever their outcome.
    pub const fn must_run_after(self) -> &'static [Step] {
        match self {
            Step::Push => &[Step::Test],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Orders the requested steps and their transitive dependencies so that every step comes after
/// its dependencies and after the steps it must run after. Ties are broken by [`Step`] order.
pub fn plan(requested: &[Step]) -> Vec<Step> {
    let mut selected = BTreeSet::new();
    let mut pending = requested.to_vec();
    while let Some(step) = pending.pop() {
        if selected.insert(step) {
            pending.extend_from_slice(step.depends_on());
        }
    }

    let predecessors = |step: Step| {
        step.depends_on()
            .iter()
            .chain(step.must_run_after())
            .copied()
            .filter(|other| selected.contains(other))
            .collect::<BTreeSet<_>>()
    };

    let mut remaining = selected
        .iter()
        .map(|&step| (step, predecessors(step)))
        .collect::<BTreeMap<_, _>>();
    let mut order = Vec::with_capacity(remaining.len());
    while let Some(next) = remaining
        .iter()
        .find(|(_, predecessors)| predecessors.is_empty())
        .map(|(&step, _)| step)
    {
        remaining.remove(&next);
        for predecessors in remaining.values_mut() {
            predecessors.remove(&next);
        }
        order.push(next);
    }
    debug_assert!(remaining.is_empty(), "step graph has a cycle");
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    UpToDate,
    Failed,
    /// Not attempted because a step it depends on did not succeed.
    Blocked,
}

impl StepOutcome {
    fn succeeded(self) -> bool {
        matches!(self, StepOutcome::Executed | StepOutcome::UpToDate)
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepOutcome::Executed => "executed",
            StepOutcome::UpToDate => "up to date",
            StepOutcome::Failed => "failed",
            StepOutcome::Blocked => "blocked",
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Ignore recorded state and run every planned step.
    pub rerun: bool,
    /// After a failure, continue with the steps that do not depend on the failed one.
    pub keep_going: bool,
    pub test_failures: FailurePolicy,
}

/// Artifacts handed from one step to the next within a run.
#[derive(Default)]
struct Artifacts {
    archive: Option<ContextArchive>,
    image_id: Option<ImageId>,
}

pub struct Pipeline<'a> {
    layout: &'a Layout,
    settings: &'a Settings,
    runner: &'a dyn Runner,
    state: StateStore,
    options: Options,
    artifacts: Artifacts,
    outcomes: Vec<(Step, StepOutcome)>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        layout: &'a Layout,
        settings: &'a Settings,
        runner: &'a dyn Runner,
        options: Options,
    ) -> Result<Self> {
        Ok(Self {
            layout,
            settings,
            runner,
            state: StateStore::load(layout.state_file())?,
            options,
            artifacts: Artifacts::default(),
            outcomes: Vec::new(),
        })
    }

    #[cfg(test)]
    pub fn outcomes(&self) -> &[(Step, StepOutcome)] {
        &self.outcomes
    }

    fn outcome(&self, step: Step) -> Option<StepOutcome> {
        self.outcomes
            .iter()
            .find_map(|&(s, outcome)| (s == step).then_some(outcome))
    }

    /// Runs the requested steps and everything they depend on. Returns the first error.
    pub fn run(&mut self, requested: &[Step]) -> Result<()> {
        let mut first_error = None;

        for step in plan(requested) {
            if let Some(blocker) = step
                .depends_on()
                .iter()
                .find(|&&dependency| !self.outcome(dependency).is_some_and(StepOutcome::succeeded))
            {
                warn!("{step}: skipped because `{blocker}` did not succeed");
                self.outcomes.push((step, StepOutcome::Blocked));
                continue;
            }

            info!("> {step}");
            match self.execute(step) {
                Ok(outcome) => {
                    if outcome == StepOutcome::UpToDate {
                        info!("{step}: up to date");
                    }
                    self.outcomes.push((step, outcome));
                }
                Err(error) => {
                    self.outcomes.push((step, StepOutcome::Failed));
                    if !self.options.keep_going {
                        return Err(error);
                    }
                    error!("{step}: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn summary(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_header(["step", "outcome"]);
        for (step, outcome) in &self.outcomes {
            table.add_row([step.name().to_owned(), outcome.to_string()]);
        }
        table
    }

    fn execute(&mut self, step: Step) -> Result<StepOutcome> {
        match step {
            Step::Package => self.package(),
            Step::Build => self.build(),
            Step::Tag => self.tag(),
            Step::Test => self.test(),
            Step::Push => self.push(),
        }
    }

    fn is_up_to_date(&self, step: Step, fingerprint: &Fingerprint, outputs: &[&Path]) -> bool {
        !self.options.rerun && self.state.is_up_to_date(step.name(), fingerprint, outputs)
    }

    fn archive(&mut self) -> Result<ContextArchive> {
        if let Some(archive) = &self.artifacts.archive {
            return Ok(archive.clone());
        }
        let archive = ContextArchive::existing(self.layout.archive_path())?;
        self.artifacts.archive = Some(archive.clone());
        Ok(archive)
    }

    fn image_id(&mut self) -> Result<ImageId> {
        if let Some(image_id) = &self.artifacts.image_id {
            return Ok(image_id.clone());
        }
        let image_id = docker::read_image_id(&self.layout.image_id_file())?;
        self.artifacts.image_id = Some(image_id.clone());
        Ok(image_id)
    }

    fn image_name(&self) -> Result<ImageName> {
        Ok(self.settings.image_name()?)
    }

    fn package(&mut self) -> Result<StepOutcome> {
        let scripts_dir = self.layout.scripts_dir();
        let releases_dir = self.layout.releases_dir.clone();
        let dockerfile = self.layout.dockerfile();
        let inputs = PackageInputs {
            scripts_dir: &scripts_dir,
            releases_dir: &releases_dir,
            dockerfile: &dockerfile,
        };
        inputs.validate()?;

        let releases = inputs.release_archives()?;
        let fingerprint = Fingerprinter::new()
            .dir("scripts", &scripts_dir)?
            .files("releases", releases.iter().map(|path| path.as_path()))?
            .file("dockerfile", &dockerfile)?
            .finish();

        let output = self.layout.archive_path();
        if self.is_up_to_date(Step::Package, &fingerprint, &[&output]) {
            self.artifacts.archive = Some(ContextArchive::existing(output)?);
            return Ok(StepOutcome::UpToDate);
        }

        let archive = package::package(&inputs, &output)?;
        self.state.record(Step::Package.name(), fingerprint)?;
        self.artifacts.archive = Some(archive);
        Ok(StepOutcome::Executed)
    }

    fn build(&mut self) -> Result<StepOutcome> {
        let archive = self.archive()?;
        let Settings {
            base_image,
            github_url,
            version,
            ..
        } = self.settings;
        let fingerprint = Fingerprinter::new()
            .property("baseImage", base_image)
            .property("githubUrl", github_url)
            .property("version", version)
            .file("context", archive.path())?
            .finish();

        let image_id_file = self.layout.image_id_file();
        if self.is_up_to_date(Step::Build, &fingerprint, &[&image_id_file]) {
            self.artifacts.image_id = Some(docker::read_image_id(&image_id_file)?);
            return Ok(StepOutcome::UpToDate);
        }

        // Whatever happens next, the previous record no longer describes the identifier file.
        self.state.invalidate(Step::Build.name())?;
        self.artifacts.image_id = None;
        let image_id = docker::build(
            self.runner,
            &archive,
            &image_id_file,
            docker::BuildArgs {
                base_image,
                version,
                github_url,
            },
        )?;
        self.state.record(Step::Build.name(), fingerprint)?;
        self.artifacts.image_id = Some(image_id);
        Ok(StepOutcome::Executed)
    }

    fn tag(&mut self) -> Result<StepOutcome> {
        let image_id = self.image_id()?;
        let image_name = self.image_name()?;
        let fingerprint = Fingerprinter::new()
            .property("imageName", image_name.as_str())
            .property("imageId", image_id.as_str())
            .finish();

        if self.is_up_to_date(Step::Tag, &fingerprint, &[]) {
            return Ok(StepOutcome::UpToDate);
        }

        docker::tag(self.runner, &image_id, &image_name)?;
        self.state.record(Step::Tag.name(), fingerprint)?;
        Ok(StepOutcome::Executed)
    }

    fn test(&mut self) -> Result<StepOutcome> {
        let image_id = self.image_id()?;
        let cases_dir = self.layout.test_cases_dir();
        layout::require_dir(&cases_dir)?;
        let selection = Selection::new(
            self.settings.tests_include.clone(),
            self.settings.tests_exclude.clone(),
        );
        let fingerprint = Fingerprinter::new()
            .property("imageId", image_id.as_str())
            .dir("cases", &cases_dir)?
            .properties("include", selection.include.iter().map(String::as_str))
            .properties("exclude", selection.exclude.iter().map(String::as_str))
            .finish();

        let output_dir = self.layout.test_output_dir();
        if self.is_up_to_date(Step::Test, &fingerprint, &[&output_dir]) {
            return Ok(StepOutcome::UpToDate);
        }

        self.state.invalidate(Step::Test.name())?;
        image_tests::run_tests(
            self.runner,
            &TestRun {
                image_id: &image_id,
                selection: &selection,
                output_dir: &output_dir,
                policy: self.options.test_failures,
            },
            image_tests::discover(&cases_dir)?,
        )?;
        self.state.record(Step::Test.name(), fingerprint)?;
        Ok(StepOutcome::Executed)
    }

    /// Pushing has an effect outside of this machine that we can not observe, so it always runs.
    fn push(&mut self) -> Result<StepOutcome> {
        let image_name = self.image_name()?;
        docker::push(self.runner, &image_name)?;
        Ok(StepOutcome::Executed)
    }
}
