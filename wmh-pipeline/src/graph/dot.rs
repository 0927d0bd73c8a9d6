//! Graphviz export of a stage graph

use super::StageGraph;
use std::fmt::Write as _;

impl StageGraph {
    /// DOT digraph, one node per stage labelled with its iteration groups
    pub fn to_dot(&self, name: &str) -> String {
        let mut out = format!("digraph \"{}\" {{\n  rankdir=TB;\n  node [shape=box];\n", escape(name));
        for stage in self.stages() {
            let label = if stage.over.is_empty() {
                stage.name.clone()
            } else {
                format!("{}\\n[{}]", stage.name, stage.over.join(" x "))
            };
            let _ = writeln!(out, "  \"{}\" [label=\"{}\"];", escape(&stage.name), escape(&label));
        }
        for stage in self.stages() {
            for edge in &stage.inputs {
                let _ = writeln!(
                    out,
                    "  \"{}\" -> \"{}\" [label=\"{}:{}\"];",
                    escape(&edge.from_stage),
                    escape(&stage.name),
                    escape(&edge.from_port),
                    escape(&edge.to_port)
                );
            }
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('"', "\\\"")
}
