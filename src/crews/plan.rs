//! Crew compilation: reference resolution, validation, and the execution
//! plan.
//!
//! Compilation turns a declarative [`CrewSpec`] plus agent/task pools into
//! a [`CompiledCrew`] whose tasks are topologically ordered along their
//! context dependencies. All structural errors are rejected here so the
//! run loop never sees an unresolved reference or a cycle.

use std::collections::{HashMap, HashSet};

use crate::agent::AgentSpec;
use crate::crew::CrewSpec;
use crate::guardrails::GuardrailPipeline;
use crate::process::Process;
use crate::schema::SchemaRegistry;
use crate::task::TaskSpec;
use crate::utilities::EngineError;

/// A crew ready to execute.
#[derive(Debug, Clone)]
pub struct CompiledCrew {
    pub spec: CrewSpec,
    /// Worker agents in listed order. Never contains the manager.
    pub agents: Vec<AgentSpec>,
    /// Manager agent, present iff the process is hierarchical.
    pub manager: Option<AgentSpec>,
    /// Tasks in listed order.
    pub tasks: Vec<TaskSpec>,
    /// Indices into `tasks` in topological execution order.
    pub order: Vec<usize>,
}

impl CompiledCrew {
    /// Worker agents keyed by name.
    pub fn worker_map(&self) -> HashMap<String, AgentSpec> {
        self.agents
            .iter()
            .map(|a| (a.name.clone(), a.clone()))
            .collect()
    }

    /// Look up a worker by name.
    pub fn worker(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Interpolate kickoff inputs into every task and agent.
    pub fn interpolate_inputs(&mut self, inputs: &HashMap<String, String>) {
        for task in &mut self.tasks {
            task.interpolate_inputs(inputs);
        }
        for agent in &mut self.agents {
            agent.interpolate_inputs(inputs);
        }
        if let Some(ref mut manager) = self.manager {
            manager.interpolate_inputs(inputs);
        }
    }
}

/// Compile a crew spec against the agent/task pools and the configured
/// guardrail pipeline and schema registry.
pub fn compile(
    spec: CrewSpec,
    agent_pool: &HashMap<String, AgentSpec>,
    task_pool: &HashMap<String, TaskSpec>,
    guardrails: &GuardrailPipeline,
    schemas: &SchemaRegistry,
) -> Result<CompiledCrew, EngineError> {
    // (a) every reference must resolve.
    let mut agents = Vec::with_capacity(spec.agents.len());
    for name in &spec.agents {
        let agent = agent_pool
            .get(name)
            .ok_or_else(|| EngineError::Validation(format!("unknown agent '{}'", name)))?;
        if agent.max_iter < 1 {
            return Err(EngineError::Validation(format!(
                "agent '{}' has max_iter {}; must be at least 1",
                name, agent.max_iter
            )));
        }
        agents.push(agent.clone());
    }

    let mut tasks = Vec::with_capacity(spec.tasks.len());
    for name in &spec.tasks {
        let task = task_pool
            .get(name)
            .ok_or_else(|| EngineError::Validation(format!("unknown task '{}'", name)))?;
        tasks.push(task.clone());
    }
    if tasks.is_empty() {
        return Err(EngineError::Validation(format!(
            "crew '{}' has no tasks",
            spec.name
        )));
    }

    // (c)/(d) process-specific rules.
    let manager = match spec.process {
        Process::Hierarchical => {
            let manager_name = spec.manager_agent.as_deref().ok_or_else(|| {
                EngineError::Validation(
                    "hierarchical process requires a manager_agent".to_string(),
                )
            })?;
            if spec.agents.iter().any(|a| a == manager_name) {
                return Err(EngineError::Validation(format!(
                    "manager '{}' must not be listed among the crew agents",
                    manager_name
                )));
            }
            let manager = agent_pool.get(manager_name).ok_or_else(|| {
                EngineError::Validation(format!("unknown manager agent '{}'", manager_name))
            })?;
            Some(manager.clone())
        }
        Process::Sequential => {
            for task in &tasks {
                let agent_name = task.agent.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "task '{}' has no agent; sequential crews require one per task",
                        task.name
                    ))
                })?;
                if !spec.agents.iter().any(|a| a == agent_name) {
                    return Err(EngineError::Validation(format!(
                        "task '{}' names agent '{}' which is not in the crew",
                        task.name, agent_name
                    )));
                }
            }
            None
        }
    };

    // Per-task references: context, guardrails, schemas.
    let task_names: HashSet<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    for task in &tasks {
        for dep in &task.context {
            if !task_names.contains(dep.as_str()) {
                return Err(EngineError::Validation(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.name, dep
                )));
            }
            if dep == &task.name {
                return Err(EngineError::Validation(format!(
                    "task '{}' depends on itself",
                    task.name
                )));
            }
        }
        guardrails
            .resolves(&task.guardrails)
            .map_err(EngineError::Validation)?;
        // (e) schema references must name a registered type.
        if let Some(ref schema) = task.output_schema {
            if !schemas.knows(schema) {
                return Err(EngineError::Validation(format!(
                    "task '{}' references unknown output schema '{}'",
                    task.name, schema
                )));
            }
        }
    }

    // (b) the dependency graph must be acyclic; order topologically,
    // preserving the listed order among ready tasks.
    let order = topological_order(&tasks)?;

    Ok(CompiledCrew {
        spec,
        agents,
        manager,
        tasks,
        order,
    })
}

/// Kahn's algorithm, stable with respect to the listed task order.
fn topological_order(tasks: &[TaskSpec]) -> Result<Vec<usize>, EngineError> {
    let index_of: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.context {
            let dep_index = index_of[dep.as_str()];
            in_degree[i] += 1;
            dependents[dep_index].push(i);
        }
    }

    let mut order = Vec::with_capacity(tasks.len());
    let mut emitted = vec![false; tasks.len()];
    while order.len() < tasks.len() {
        let next = (0..tasks.len()).find(|&i| !emitted[i] && in_degree[i] == 0);
        let Some(next) = next else {
            let stuck: Vec<&str> = tasks
                .iter()
                .enumerate()
                .filter(|(i, _)| !emitted[*i])
                .map(|(_, t)| t.name.as_str())
                .collect();
            return Err(EngineError::Validation(format!(
                "task dependency cycle involving: {}",
                stuck.join(", ")
            )));
        };
        emitted[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pools() -> (HashMap<String, AgentSpec>, HashMap<String, TaskSpec>) {
        let mut agents = HashMap::new();
        for name in ["research", "writer", "boss"] {
            agents.insert(
                name.to_string(),
                AgentSpec::new(name, name, "goal", "backstory"),
            );
        }
        let mut tasks = HashMap::new();
        tasks.insert(
            "a".to_string(),
            TaskSpec::new("a", "do a", "out a").with_agent("research"),
        );
        tasks.insert(
            "b".to_string(),
            TaskSpec::new("b", "do b", "out b")
                .with_agent("writer")
                .with_context(vec!["a"]),
        );
        (agents, tasks)
    }

    fn spec(process: Process) -> CrewSpec {
        CrewSpec {
            name: "crew".to_string(),
            process,
            agents: vec!["research".to_string(), "writer".to_string()],
            tasks: vec!["a".to_string(), "b".to_string()],
            manager_agent: None,
            memory_enabled: true,
            knowledge_sources: Vec::new(),
            planning_enabled: false,
            unknown: HashMap::new(),
        }
    }

    #[test]
    fn test_compile_sequential_happy_path() {
        let (agents, tasks) = pools();
        let compiled = compile(
            spec(Process::Sequential),
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap();
        assert_eq!(compiled.order, vec![0, 1]);
        assert!(compiled.manager.is_none());
    }

    #[test]
    fn test_unknown_agent_rejected() {
        let (agents, tasks) = pools();
        let mut bad = spec(Process::Sequential);
        bad.agents.push("ghost".to_string());
        let err = compile(
            bad,
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown agent 'ghost'"));
    }

    #[test]
    fn test_cycle_rejected() {
        let (agents, mut tasks) = pools();
        tasks.get_mut("a").unwrap().context = vec!["b".to_string()];
        let err = compile(
            spec(Process::Sequential),
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_sequential_requires_task_agents() {
        let (agents, mut tasks) = pools();
        tasks.get_mut("a").unwrap().agent = None;
        let err = compile(
            spec(Process::Sequential),
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("has no agent"));
    }

    #[test]
    fn test_hierarchical_requires_manager_outside_crew() {
        let (agents, tasks) = pools();

        let mut no_manager = spec(Process::Hierarchical);
        no_manager.manager_agent = None;
        assert!(compile(
            no_manager,
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new()
        )
        .is_err());

        let mut listed_manager = spec(Process::Hierarchical);
        listed_manager.manager_agent = Some("research".to_string());
        assert!(compile(
            listed_manager,
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new()
        )
        .is_err());

        let mut good = spec(Process::Hierarchical);
        good.manager_agent = Some("boss".to_string());
        let compiled = compile(
            good,
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap();
        // The manager is injected at runtime and never listed as a worker.
        assert_eq!(compiled.manager.as_ref().unwrap().name, "boss");
        assert!(compiled.agents.iter().all(|a| a.name != "boss"));
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let (agents, mut tasks) = pools();
        tasks.get_mut("a").unwrap().output_schema = Some("missing".to_string());
        let err = compile(
            spec(Process::Sequential),
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown output schema"));
    }

    #[test]
    fn test_topological_order_is_stable() {
        let (agents, mut tasks) = pools();
        // c is listed last but independent; it must not jump ahead of a.
        tasks.insert(
            "c".to_string(),
            TaskSpec::new("c", "do c", "out c").with_agent("research"),
        );
        let mut crew_spec = spec(Process::Sequential);
        crew_spec.tasks.push("c".to_string());
        let compiled = compile(
            crew_spec,
            &agents,
            &tasks,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )
        .unwrap();
        assert_eq!(compiled.order, vec![0, 1, 2]);
    }
}
