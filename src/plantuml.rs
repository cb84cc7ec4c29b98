//! PlantUML diagram generation

use crate::graph::{EventId, StateGraph, StateId, Target};

/// Generate a PlantUML diagram of the declared hierarchy and transitions
pub(crate) fn generate_plantuml<S, E>(graph: &StateGraph<S, E>, current: Option<usize>) -> String
where
    S: StateId,
    E: EventId,
{
    let mut plantuml = String::new();
    plantuml.push_str("@startuml\n");
    plantuml.push_str("skinparam state {\n");
    plantuml.push_str("  BackgroundColor<<Current>> YellowGreen\n");
    plantuml.push_str("}\n\n");

    // Hierarchy first
    let mut parents = Vec::new();
    for node in graph.nodes() {
        if let Some(parent) = node.parent {
            parents.push(format!(
                "{:?} -up-> {:?} : parent\n",
                node.id,
                graph.node(parent).id
            ));
        }
    }
    if !parents.is_empty() {
        for line in &parents {
            plantuml.push_str(line);
        }
        plantuml.push('\n');
    }

    // HashMap order is unstable, so sort for reproducible output
    let mut transitions = Vec::new();
    for node in graph.nodes() {
        for (event, transition) in &node.transitions {
            let line = match &transition.target {
                Target::Static(to) => {
                    format!("{:?} --> {:?} : {:?}\n", node.id, graph.node(*to).id, event)
                }
                Target::Dynamic(_) => format!("{:?} : {:?} -> dynamic target\n", node.id, event),
            };
            transitions.push(line);
        }
    }
    transitions.sort();
    for line in &transitions {
        plantuml.push_str(line);
    }

    if let Some(current) = current {
        plantuml.push_str(&format!("state {:?} <<Current>>\n", graph.node(current).id));
    }

    plantuml.push_str("@enduml\n");
    plantuml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ArgumentTransfer, StateDecl, TargetDecl, TransitionDecl};
    use std::sync::Arc;

    #[test]
    fn diagram_lists_hierarchy_and_transitions() {
        let mut on = StateDecl::new("On", None);
        on.transitions.push(TransitionDecl {
            event: "off",
            target: TargetDecl::Static("Off"),
            action: None,
        });
        let mut bright = StateDecl::new("Bright", Some("On"));
        bright.transitions.push(TransitionDecl {
            event: "toggle",
            target: TargetDecl::Dynamic(Arc::new(|| -> anyhow::Result<Option<&'static str>> { Ok(None) })),
            action: None,
        });
        let off = StateDecl::new("Off", None);
        let graph: StateGraph<&str, &str> =
            StateGraph::build(vec![on, bright, off], &"Off", ArgumentTransfer::Free).unwrap();

        let uml = generate_plantuml(&graph, graph.index_of(&"Bright"));
        assert!(uml.starts_with("@startuml\n"));
        assert!(uml.contains("\"Bright\" -up-> \"On\" : parent"));
        assert!(uml.contains("\"On\" --> \"Off\" : \"off\""));
        assert!(uml.contains("\"Bright\" : \"toggle\" -> dynamic target"));
        assert!(uml.contains("state \"Bright\" <<Current>>"));
        assert!(uml.ends_with("@enduml\n"));
    }
}
