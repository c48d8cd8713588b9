use std::collections::HashSet;

use super::parser::ParsedAction;

/// Actions that may start together once every earlier group has settled.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionGroup {
    pub actions: Vec<ParsedAction>,
    /// False when the group holds two or more mutating actions; they then run one at a time.
    pub parallel: bool,
}

impl ActionGroup {
    fn new(actions: Vec<ParsedAction>) -> Self {
        let mutating = actions.iter().filter(|a| a.is_mutating()).count();
        Self {
            parallel: mutating <= 1,
            actions,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|a| a.id.as_str())
    }
}

/// Ordered action groups derived from one parse pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionPlan {
    pub groups: Vec<ActionGroup>,
}

impl ExecutionPlan {
    /// Layered topological sort: each wave holds every action whose dependencies
    /// are completed, refer outside the batch, or refer to a terminal action.
    pub fn build(actions: Vec<ParsedAction>) -> Self {
        let terminal: HashSet<String> = actions
            .iter()
            .filter(|a| a.is_terminal())
            .map(|a| a.id.clone())
            .collect();
        let mut pending = actions;
        let mut completed: HashSet<String> = HashSet::new();
        let mut groups = Vec::new();

        while !pending.is_empty() {
            let pending_ids: HashSet<String> = pending.iter().map(|a| a.id.clone()).collect();
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|a| {
                a.dependencies.iter().all(|dep| {
                    completed.contains(dep) || terminal.contains(dep) || !pending_ids.contains(dep)
                })
            });

            if ready.is_empty() {
                // Unreachable with backward-only dependencies; keep source order, one at a time.
                tracing::warn!(
                    remaining = blocked.len(),
                    "dependency cycle in plan, running remainder sequentially"
                );
                groups.push(ActionGroup {
                    actions: blocked,
                    parallel: false,
                });
                break;
            }

            completed.extend(ready.iter().map(|a| a.id.clone()));
            groups.push(ActionGroup::new(ready));
            pending = blocked;
        }

        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn action_count(&self) -> usize {
        self.groups.iter().map(|g| g.actions.len()).sum()
    }

    pub fn actions(&self) -> impl Iterator<Item = &ParsedAction> {
        self.groups.iter().flat_map(|g| g.actions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::parser::ActionParser;

    fn plan(text: &str) -> ExecutionPlan {
        ActionParser::new().parse(text)
    }

    #[test]
    fn independent_reads_share_one_parallel_group() {
        let p = plan(
            "<read_file><path>a</path></read_file>\
             <read_file><path>b</path></read_file>\
             <search_string><directory>.</directory><term>x</term></search_string>",
        );
        assert_eq!(p.groups.len(), 1);
        assert!(p.groups[0].parallel);
        assert_eq!(p.action_count(), 3);
    }

    #[test]
    fn write_then_delete_same_path_is_two_groups() {
        let p = plan(
            "<write_file><path>t.txt</path><content>x</content></write_file>\
             <delete_file><path>t.txt</path></delete_file>",
        );
        assert!(p.groups.len() >= 2);
        let ids: Vec<_> = p.actions().map(|a| a.id.clone()).collect();
        let group_of = |id: &str| p.groups.iter().position(|g| g.actions.iter().any(|a| a.id == id));
        let write = group_of(&ids[0]).unwrap();
        let delete = group_of(&ids[1]).unwrap();
        assert!(write < delete);
    }

    #[test]
    fn echoed_read_precedes_write() {
        let p = plan(
            "<read_file><path>in.txt</path></read_file>\
             <write_file><path>out.txt</path><content>based on <path>in.txt</path></content></write_file>",
        );
        assert_eq!(p.groups.len(), 2);
        assert_eq!(p.groups[0].actions[0].tag, "read_file");
        assert_eq!(p.groups[1].actions[0].tag, "write_file");
    }

    #[test]
    fn two_mutations_in_one_wave_run_sequentially() {
        let p = plan(
            "<write_file><path>a</path><content>1</content></write_file>\
             <write_file><path>b</path><content>2</content></write_file>\
             <read_file><path>c</path></read_file>",
        );
        assert_eq!(p.groups.len(), 1);
        assert!(!p.groups[0].parallel);
    }

    #[test]
    fn single_mutation_with_reads_stays_parallel() {
        let p = plan(
            "<execute_command>cargo build</execute_command>\
             <read_file><path>c</path></read_file>",
        );
        assert_eq!(p.groups.len(), 1);
        assert!(p.groups[0].parallel);
    }

    #[test]
    fn chain_produces_layers() {
        let p = plan(
            "<read_file><path>a</path></read_file>\
             <write_file><path>a</path><content>v2</content></write_file>\
             <move_file><source_path>a</source_path><destination_path>b</destination_path></move_file>",
        );
        assert_eq!(p.groups.len(), 3);
        assert_eq!(p.groups[2].actions[0].tag, "move_file");
    }

    #[test]
    fn dependencies_outside_batch_count_as_satisfied() {
        let mut parser = ActionParser::new();
        let mut actions = parser.feed("<delete_file><path>a</path></delete_file>");
        actions[0].dependencies.insert("from-earlier-pass".into());
        let p = ExecutionPlan::build(actions);
        assert_eq!(p.groups.len(), 1);
    }

    #[test]
    fn empty_input_gives_empty_plan() {
        let p = plan("no actions here");
        assert!(p.is_empty());
        assert_eq!(p.action_count(), 0);
    }
}
