//! Subscription targets

use std::collections::{BTreeMap, BTreeSet};

use crate::layout::DataLayout;

/// Projects and runs a subscription listens to
///
/// A project mapped to `None` follows every run in it, including runs
/// created after the subscription started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Targets {
    projects: BTreeMap<String, Option<BTreeSet<String>>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow every run of `project`
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.projects.insert(project.into(), None);
        self
    }

    /// Follow one run; ignored if the whole project is already followed
    pub fn run(mut self, project: impl Into<String>, run: impl Into<String>) -> Self {
        let entry = self
            .projects
            .entry(project.into())
            .or_insert_with(|| Some(BTreeSet::new()));
        if let Some(runs) = entry {
            runs.insert(run.into());
        }
        self
    }

    /// Follow a list of runs
    pub fn runs<I, S>(self, project: &str, runs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        runs.into_iter().fold(self, |targets, run| targets.run(project, run))
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn projects(&self) -> impl Iterator<Item = &str> {
        self.projects.keys().map(String::as_str)
    }

    pub fn matches(&self, project: &str, run: &str) -> bool {
        match self.projects.get(project) {
            Some(None) => true,
            Some(Some(runs)) => runs.contains(run),
            None => false,
        }
    }

    /// Concrete `(project, run)` pairs, discovering runs for whole projects
    pub(crate) fn resolve(&self, layout: &DataLayout) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (project, runs) in &self.projects {
            let runs = match runs {
                Some(runs) => runs.clone(),
                None => layout.discover_runs(project).unwrap_or_else(|e| {
                    tracing::warn!(project = %project, error = %e, "run discovery failed");
                    BTreeSet::new()
                }),
            };
            pairs.extend(runs.into_iter().map(|run| (project.clone(), run)));
        }
        pairs
    }
}
