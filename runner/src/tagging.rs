use crate::{config::ConfigErrors, partition::ParallelLevel};
use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};
use tracing::{debug, error};

/// Output and restart streams of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTags {
    pub output: PathBuf,
    pub restart: PathBuf,
}

impl OutputTags {
    pub fn new(output: impl Into<PathBuf>, restart: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            restart: restart.into(),
        }
    }
}

/// Decides the streams of a process once a level has been pushed.
///
/// Returns `None` for processes that don't write any stream at that level.
pub trait OutputTagger {
    fn tag(&self, level: &ParallelLevel, base: &OutputTags)
        -> Result<Option<OutputTags>, ConfigErrors>;
}

/// Gives every server leader its own streams as soon as a level has more than one
/// server. Suffixes of nested levels accumulate, e.g. `out.2.1`.
#[derive(Debug, Clone, Default)]
pub struct ServerTagger {
    // prefix file names with the host name to keep node-local files apart
    pub node_local: bool,
}

impl OutputTagger for ServerTagger {
    fn tag(
        &self,
        level: &ParallelLevel,
        base: &OutputTags,
    ) -> Result<Option<OutputTags>, ConfigErrors> {
        let mut tags = if level.is_master() {
            base.clone()
        } else if level.is_group_leader() && level.num_servers() > 1 {
            let suffix = level.server_id().to_string();

            OutputTags {
                output: append_suffix(&base.output, &suffix),
                restart: append_suffix(&base.restart, &suffix),
            }
        } else if level.is_group_leader() {
            base.clone()
        } else {
            return Ok(None);
        };

        if self.node_local {
            prepend_hostname(&mut tags.output)?;
            prepend_hostname(&mut tags.restart)?;
        }

        debug!(output = ?tags.output, restart = ?tags.restart, "Tagged streams");

        Ok(Some(tags))
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut file_name = path
        .file_name()
        .map(OsStr::to_owned)
        .unwrap_or_else(|| OsString::from("parsched"));
    file_name.push(".");
    file_name.push(suffix);

    path.with_file_name(file_name)
}

pub fn prepend_hostname(input: &mut PathBuf) -> Result<(), ConfigErrors> {
    match nix::unistd::gethostname() {
        Ok(mut hostname) => {
            let file_name = input.file_name().unwrap_or(OsStr::new("parsched.out"));
            hostname.push("_");
            hostname.push(file_name);
            input.set_file_name(hostname);

            Ok(())
        }
        Err(error) => {
            error!(error = ?error, "Failed to retrieve hostname for node-local output: {error}");

            Err(error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        comm::Universe,
        config::ConcurrencyHints,
        partition::{resolve_and_build, ProcessGroup},
    };

    fn base() -> OutputTags {
        OutputTags::new("run/out.log", "run/restart.bin")
    }

    fn tag_all(size: usize, hints: ConcurrencyHints) -> Vec<Option<OutputTags>> {
        Universe::launch(size, |world| {
            let world = ParallelLevel::world(ProcessGroup::new(world));
            let level = resolve_and_build(&world, &hints).unwrap();

            ServerTagger::default().tag(&level, &base()).unwrap()
        })
        .unwrap()
    }

    #[test]
    fn suffix_keeps_directory() {
        assert_eq!(
            append_suffix(Path::new("run/out.log"), "3"),
            PathBuf::from("run/out.log.3")
        );
    }

    #[test]
    fn server_leaders_get_their_own_streams() {
        let tags = tag_all(4, ConcurrencyHints::default().servers(2));

        assert_eq!(
            tags,
            vec![
                Some(OutputTags::new("run/out.log.1", "run/restart.bin.1")),
                None,
                Some(OutputTags::new("run/out.log.2", "run/restart.bin.2")),
                None,
            ]
        );
    }

    #[test]
    fn single_server_keeps_the_base_streams() {
        let tags = tag_all(3, ConcurrencyHints::default());

        assert_eq!(tags, vec![Some(base()), None, None]);
    }

    #[test]
    fn master_keeps_the_base_and_idle_writes_nothing() {
        let tags = tag_all(4, ConcurrencyHints::default().servers(1).procs_per_server(2));

        assert_eq!(
            tags,
            vec![
                Some(base()),
                Some(base()),
                None,
                None,
            ]
        );
    }

    #[test]
    fn node_local_prefixes_the_host() {
        let hostname = nix::unistd::gethostname().unwrap();
        let mut path = PathBuf::from("run/out.log");
        prepend_hostname(&mut path).unwrap();

        let mut expected = hostname;
        expected.push("_out.log");
        assert_eq!(path, Path::new("run").join(expected));
    }
}
