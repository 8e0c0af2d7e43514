use std::{fs, io, path::Path};

use image_ref::{ImageId, ImageName};
use log::{debug, info, warn};

use crate::{
    layout::{self, MissingInput},
    package::ContextArchive,
    process::{self, Runner},
    Result,
};

const DOCKER: &str = "docker";
/// Where names without a registry component are pushed to.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Build arguments consumed by the Dockerfile.
pub struct BuildArgs<'a> {
    pub base_image: &'a str,
    pub version: &'a str,
    pub github_url: &'a str,
}

impl BuildArgs<'_> {
    fn to_flags(&self) -> [String; 3] {
        [
            format!("BASE_IMAGE={}", self.base_image),
            format!("SOLR_VERSION={}", self.version),
            format!("GITHUB_URL={}", self.github_url),
        ]
    }
}

/// Streams `archive` to `docker build` as its context and returns the identifier of the resulting
/// image. The engine writes the identifier to `image_id_file` itself.
pub fn build(
    runner: &dyn Runner,
    archive: &ContextArchive,
    image_id_file: &Path,
    args: BuildArgs,
) -> Result<ImageId> {
    // Never leave the identifier of a previous build behind if this one fails.
    match fs::remove_file(image_id_file) {
        Ok(()) => debug!("removed stale image identifier {image_id_file:?}"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    if let Some(parent) = image_id_file.parent() {
        fs::create_dir_all(parent)?;
    }

    let [base_image, version, github_url] = args.to_flags();
    let command = process::command!(
        DOCKER,
        "build",
        "--iidfile",
        image_id_file,
        "--build-arg",
        base_image,
        "--build-arg",
        version,
        "--build-arg",
        github_url,
        // Read the context from stdin.
        "-",
    )
    .stdin(archive.open()?);
    runner.run(command)?;

    let image_id = read_image_id(image_id_file)?;
    info!("Built image {image_id}");
    Ok(image_id)
}

/// Reads the identifier written by [`build`]. Fails if the file is absent, empty or does not hold
/// an identifier.
pub fn read_image_id(image_id_file: &Path) -> Result<ImageId> {
    let contents = match fs::read_to_string(image_id_file) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            return Err(MissingInput {
                kind: layout::InputKind::File,
                path: image_id_file.to_owned(),
                hint: Some("run the `build` step first"),
            }
            .into())
        }
        Err(error) => return Err(error.into()),
    };
    let contents = contents.trim();
    if contents.is_empty() {
        return Err(format!("image identifier file {image_id_file:?} is empty").into());
    }
    Ok(contents.parse::<ImageId>()?)
}

pub fn tag(runner: &dyn Runner, image_id: &ImageId, name: &ImageName) -> Result<()> {
    if name.tag().is_none() {
        warn!("image name {name} has no tag, the engine will tag the image as `latest`");
    }
    runner.run(process::command!(DOCKER, "tag", image_id, name))?;
    info!("Tagged image {image_id} as {name}");
    Ok(())
}

pub fn push(runner: &dyn Runner, name: &ImageName) -> Result<()> {
    runner.run(process::command!(DOCKER, "push", name))?;
    info!(
        "Pushed image {name} to {}",
        name.registry().unwrap_or(DEFAULT_REGISTRY)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::{arg_after, FakeRunner};

    const IMAGE_ID: &str =
        "sha256:0b1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0b1c";

    fn archive(dir: &Path) -> ContextArchive {
        let path = dir.join("solr-docker.tgz");
        fs::write(&path, "context").unwrap();
        ContextArchive::existing(path).unwrap()
    }

    fn args() -> BuildArgs<'static> {
        BuildArgs {
            base_image: "eclipse-temurin:17-jre-jammy",
            version: "9.5.0",
            github_url: "github.com",
        }
    }

    #[test]
    fn build_invokes_docker_and_reads_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let image_id_file = dir.path().join("build/image-id");
        let runner = FakeRunner::with_handler(|command| {
            let path = arg_after(command, "--iidfile").unwrap();
            fs::write(path, format!("{IMAGE_ID}\n")).unwrap();
            0
        });

        let image_id = build(&runner, &archive(dir.path()), &image_id_file, args()).unwrap();

        assert_eq!(image_id.as_str(), IMAGE_ID);
        assert_eq!(
            runner.calls(),
            [[
                "docker",
                "build",
                "--iidfile",
                image_id_file.to_str().unwrap(),
                "--build-arg",
                "BASE_IMAGE=eclipse-temurin:17-jre-jammy",
                "--build-arg",
                "SOLR_VERSION=9.5.0",
                "--build-arg",
                "GITHUB_URL=github.com",
                "-",
            ]
            .map(String::from)]
        );
    }

    #[test]
    fn failed_build_removes_stale_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let image_id_file = dir.path().join("image-id");
        fs::write(&image_id_file, IMAGE_ID).unwrap();
        let runner = FakeRunner::with_handler(|_| 1);

        let error = build(&runner, &archive(dir.path()), &image_id_file, args()).unwrap_err();

        let error = error.downcast_ref::<process::Error>().unwrap();
        assert_eq!(error.exit_code().map(|code| code.get()), Some(1));
        assert!(!image_id_file.exists());
    }

    #[test]
    fn build_without_identifier_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let image_id_file = dir.path().join("image-id");
        let runner = FakeRunner::succeeding();

        let error = build(&runner, &archive(dir.path()), &image_id_file, args()).unwrap_err();
        assert!(error.downcast_ref::<MissingInput>().is_some());
    }

    #[test]
    fn read_image_id_rejects_empty_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image-id");

        fs::write(&path, "  \n").unwrap();
        assert!(read_image_id(&path).unwrap_err().to_string().contains("is empty"));

        fs::write(&path, "not an id").unwrap();
        assert!(read_image_id(&path)
            .unwrap_err()
            .downcast_ref::<image_ref::InvalidImageId>()
            .is_some());

        fs::write(&path, format!("{IMAGE_ID}\n")).unwrap();
        assert_eq!(read_image_id(&path).unwrap().short(), "0b1c2d3e4f5a");
    }

    #[test]
    fn tag_and_push_commands() {
        let runner = FakeRunner::succeeding();
        let image_id: ImageId = IMAGE_ID.parse().unwrap();
        let name: ImageName = "apache/solr:9.5.0".parse().unwrap();

        tag(&runner, &image_id, &name).unwrap();
        push(&runner, &name).unwrap();

        assert_eq!(
            runner.calls(),
            [
                vec!["docker", "tag", IMAGE_ID, "apache/solr:9.5.0"],
                vec!["docker", "push", "apache/solr:9.5.0"],
            ]
        );
    }

    #[test]
    fn names_with_registry_and_without_tag_are_passed_verbatim() {
        let runner = FakeRunner::succeeding();
        let image_id: ImageId = IMAGE_ID.parse().unwrap();
        let name: ImageName = "localhost:5000/solr".parse().unwrap();
        assert_eq!(name.registry(), Some("localhost:5000"));
        assert_eq!(name.tag(), None);

        tag(&runner, &image_id, &name).unwrap();
        push(&runner, &name).unwrap();

        assert_eq!(
            runner.calls(),
            [
                vec!["docker", "tag", IMAGE_ID, "localhost:5000/solr"],
                vec!["docker", "push", "localhost:5000/solr"],
            ]
        );
    }
}
