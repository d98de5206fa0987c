//! Output rendering for the trellisctl CLI.

use serde_json::Value;

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value[key].as_str().unwrap_or("-")
}

/// Print a graph template summary.
pub fn print_graph(graph: &Value) {
    println!("Graph: {}/{}", str_field(graph, "namespace"), str_field(graph, "name"));
    println!("  Status: {}", str_field(graph, "validation_status"));

    if let Some(nodes) = graph["nodes"].as_array() {
        println!("  Nodes:  {}", nodes.len());
        for node in nodes {
            let next = node["next_nodes"]
                .as_array()
                .map(|n| {
                    n.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            if next.is_empty() {
                println!("    {} ({})", str_field(node, "identifier"), str_field(node, "node_name"));
            } else {
                println!(
                    "    {} ({}) -> {}",
                    str_field(node, "identifier"),
                    str_field(node, "node_name"),
                    next
                );
            }
        }
    }

    if let Some(errors) = graph["validation_errors"].as_array() {
        if !errors.is_empty() {
            println!("  Validation errors:");
            for error in errors {
                println!("    - {}", error.as_str().unwrap_or("?"));
            }
        }
    }
}

/// Print a list of graph templates in tabular format.
pub fn print_graph_list(graphs: &[Value]) {
    if graphs.is_empty() {
        println!("No graph templates found.");
        return;
    }

    println!("{:<28}  {:<10}  {:<6}", "NAME", "STATUS", "NODES");
    println!("{}", "-".repeat(48));
    for graph in graphs {
        println!(
            "{:<28}  {:<10}  {:<6}",
            str_field(graph, "name"),
            str_field(graph, "validation_status"),
            graph["nodes"].as_array().map_or(0, Vec::len),
        );
    }
    println!();
    println!("{} graph(s)", graphs.len());
}

/// Print the states returned by trigger or create.
pub fn print_created_states(response: &Value) {
    if let Some(run_id) = response["run_id"].as_str() {
        println!("Run: {run_id}");
    }
    let Some(states) = response["states"].as_array() else {
        return;
    };
    for state in states {
        println!(
            "  {}  {}  ({})",
            str_field(state, "state_id"),
            str_field(state, "identifier"),
            str_field(state, "node_name"),
        );
    }
    println!("{} state(s) created", states.len());
}

/// Print a lease batch with resolved inputs.
pub fn print_leased(response: &Value) {
    let Some(states) = response["states"].as_array() else {
        return;
    };
    if states.is_empty() {
        println!("No states ready.");
        return;
    }
    for state in states {
        println!("{}  {}", str_field(state, "state_id"), str_field(state, "identifier"));
        if let Some(inputs) = state["inputs"].as_object() {
            for (key, value) in inputs {
                println!("    {key} = {}", value.as_str().unwrap_or("?"));
            }
        }
    }
    println!("{} state(s) leased", states.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn str_field_falls_back_on_missing_keys() {
        let value = json!({ "present": "x" });
        assert_eq!(str_field(&value, "present"), "x");
        assert_eq!(str_field(&value, "absent"), "-");
    }
}
