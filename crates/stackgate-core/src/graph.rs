//! Project dependency graph and impacted-project resolution.
//!
//! Projects are nodes. An edge `A → B` means "B depends on A": A's jobs run
//! before B's. Cycles are rejected when the graph is built, so a graph that
//! exists is always a DAG.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::config::{DependencyMode, GateConfig, Project};
use crate::error::{GateError, GateResult};
use crate::glob::{match_include_exclude, Glob};
use crate::jobs::Job;

/// Directed dependency graph over configured [`Project`]s.
#[derive(Debug, Clone, Default)]
pub struct ProjectGraph {
    nodes: HashMap<String, Project>,
    /// `dependency → {dependent, ...}`
    downstream: HashMap<String, HashSet<String>>,
    /// `dependent → {dependency, ...}`
    upstream: HashMap<String, HashSet<String>>,
}

impl ProjectGraph {
    /// Build from project declarations.
    ///
    /// A `depends_on` entry naming an unknown project is
    /// [`GateError::UnknownProject`]; a cycle is [`GateError::DependencyCycle`].
    pub fn from_projects(projects: &[Project]) -> GateResult<Self> {
        let mut graph = Self::default();
        for project in projects {
            graph.add_node(project.clone());
        }
        for project in projects {
            for dependency in &project.depends_on {
                graph.add_dependency(dependency, &project.name)?;
            }
        }
        Ok(graph)
    }

    pub fn add_node(&mut self, project: Project) {
        let name = project.name.clone();
        self.nodes.insert(name.clone(), project);
        self.downstream.entry(name.clone()).or_default();
        self.upstream.entry(name).or_default();
    }

    /// Add `dependent` depends on `dependency`. Rolled back if it closes a
    /// cycle.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> GateResult<()> {
        for name in [dependency, dependent] {
            if !self.nodes.contains_key(name) {
                return Err(GateError::UnknownProject {
                    project: name.to_string(),
                });
            }
        }

        self.downstream
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        self.upstream
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());

        if let Some(cycle) = self.find_cycle_through(dependent) {
            if let Some(set) = self.downstream.get_mut(dependency) {
                set.remove(dependent);
            }
            if let Some(set) = self.upstream.get_mut(dependent) {
                set.remove(dependency);
            }
            return Err(GateError::DependencyCycle { projects: cycle });
        }
        Ok(())
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dependencies before dependents. Kahn's algorithm with each newly
    /// freed frontier sorted by name, so the order is stable across runs.
    pub fn topological_order(&self) -> GateResult<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), self.upstream.get(name).map_or(0, HashSet::len)))
            .collect();

        let mut roots: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();
        roots.sort_unstable();
        let mut queue: VecDeque<&str> = roots.into();

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(name) = queue.pop_front() {
            sorted.push(name.to_string());
            let mut next: Vec<&str> = Vec::new();
            if let Some(dependents) = self.downstream.get(name) {
                for dependent in dependents {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            next.sort_unstable();
            queue.extend(next);
        }

        if sorted.len() != self.nodes.len() {
            let done: HashSet<&str> = sorted.iter().map(String::as_str).collect();
            let mut stuck: Vec<String> = self
                .nodes
                .keys()
                .filter(|n| !done.contains(n.as_str()))
                .cloned()
                .collect();
            stuck.sort();
            return Err(GateError::DependencyCycle { projects: stuck });
        }
        Ok(sorted)
    }

    /// Direct dependents of `name`, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .downstream
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Every project reachable downstream of `name` (BFS), excluding `name`.
    pub fn transitive_dependents_of(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.downstream.get(&current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        seen.remove(name);
        seen
    }

    /// `impacted` plus every transitive dependent, in topological order.
    ///
    /// The result is a superset of `impacted` and applying this again to
    /// the result returns the same set.
    pub fn find_all_projects_dependant_on_impacted_projects(
        &self,
        impacted: &[Project],
    ) -> GateResult<Vec<Project>> {
        let mut wanted: HashSet<String> = HashSet::new();
        for project in impacted {
            wanted.insert(project.name.clone());
            wanted.extend(self.transitive_dependents_of(&project.name));
        }

        let mut out: Vec<Project> = self
            .topological_order()?
            .into_iter()
            .filter(|name| wanted.contains(name))
            .filter_map(|name| self.nodes.get(&name).cloned())
            .collect();
        // Impacted projects the graph does not know about are kept as-is.
        for project in impacted {
            if !self.nodes.contains_key(&project.name) {
                out.push(project.clone());
            }
        }
        Ok(out)
    }

    /// Reorder jobs so upstream projects come first. Jobs for the same
    /// project keep their relative order; jobs for projects outside the
    /// graph go last, by name.
    pub fn sorted_jobs_by_dependency(&self, jobs: Vec<Job>) -> GateResult<Vec<Job>> {
        let position: HashMap<String, usize> = self
            .topological_order()?
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i))
            .collect();
        let mut jobs = jobs;
        jobs.sort_by(|a, b| {
            let pa = position.get(&a.project_name).copied().unwrap_or(usize::MAX);
            let pb = position.get(&b.project_name).copied().unwrap_or(usize::MAX);
            pa.cmp(&pb).then_with(|| {
                if pa == usize::MAX {
                    a.project_name.cmp(&b.project_name)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
        });
        Ok(jobs)
    }

    // -- internal ------------------------------------------------------------

    fn find_cycle_through(&self, start: &str) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_cycle(
        &self,
        current: &str,
        target: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        path.push(current.to_string());
        if let Some(dependents) = self.downstream.get(current) {
            for next in dependents {
                if next == target {
                    return true;
                }
                if visited.insert(next.clone()) && self.dfs_cycle(next, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }
}

/// Compiled include/exclude patterns for one project.
struct ProjectMatcher<'a> {
    project: &'a Project,
    include: Vec<Glob>,
    exclude: Vec<Glob>,
}

impl<'a> ProjectMatcher<'a> {
    fn new(project: &'a Project) -> GateResult<Self> {
        let dir_pattern = if project.terragrunt {
            format!("{}/*", project.dir)
        } else {
            format!("{}/**/*", project.dir)
        };
        let include = project
            .include_patterns
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(dir_pattern.as_str()))
            .map(Glob::new)
            .collect::<GateResult<Vec<_>>>()?;
        let exclude = project
            .exclude_patterns
            .iter()
            .map(|p| Glob::new(p))
            .collect::<GateResult<Vec<_>>>()?;
        Ok(Self {
            project,
            include,
            exclude,
        })
    }

    fn matches_any(&self, changed_files: &[String]) -> bool {
        changed_files
            .iter()
            .any(|f| match_include_exclude(f, &self.include, &self.exclude))
    }
}

/// Projects whose directory or include patterns match a changed file, in
/// configuration order.
pub fn get_modified_projects(
    projects: &[Project],
    changed_files: &[String],
) -> GateResult<Vec<Project>> {
    let mut out = Vec::new();
    for project in projects {
        let matcher = ProjectMatcher::new(project)?;
        if matcher.matches_any(changed_files) {
            debug!(project = %project.name, "project impacted by change");
            out.push(matcher.project.clone());
        }
    }
    Ok(out)
}

/// Changed files → impacted projects, widened by dependents in hard mode.
pub fn impacted_projects(
    config: &GateConfig,
    graph: &ProjectGraph,
    changed_files: &[String],
) -> GateResult<Vec<Project>> {
    let modified = get_modified_projects(&config.projects, changed_files)?;
    match config.dependency_mode {
        DependencyMode::Soft => Ok(modified),
        DependencyMode::Hard => graph.find_all_projects_dependant_on_impacted_projects(&modified),
    }
}
