use std::fmt::Write as _;

use crate::foundation::ids::TaskId;
use crate::task::graph::TaskGraph;

const RULE: &str = "-------------------------------------------";

/// Render one task line, without children.
pub(crate) fn describe_task(graph: &TaskGraph, id: TaskId) -> String {
    let node = &graph[id];
    let mut line = node.name().to_string();
    if let Some(b) = node.bounds {
        let _ = write!(
            line,
            " bounds ({:.6}, {:.6})-({:.6}, {:.6})",
            b.x0, b.y0, b.x1, b.y1
        );
    }
    if node.target_rect.is_valid() {
        let _ = write!(line, " target {}", node.target_rect);
    }
    if let Some(target) = &node.target {
        let _ = write!(line, " surface {target:?}");
    }
    line
}

/// Append the task tree rooted at `task` to `out`, one node per line, children indented by two
/// spaces.
pub(crate) fn dump_task(
    graph: &TaskGraph,
    task: Option<TaskId>,
    prefix: &str,
    out: &mut Vec<String>,
) {
    let Some(id) = task else {
        out.push(format!("{prefix} NULL"));
        return;
    };
    out.push(format!("{prefix}{}", describe_task(graph, id)));
    let child_prefix = format!("{prefix}  ");
    for &sub in &graph[id].sub_tasks {
        dump_task(graph, sub, &child_prefix, out);
    }
}

/// Lines of a titled list dump. The title is embedded in the opening rule.
pub fn dump_list(graph: &TaskGraph, list: &[Option<TaskId>], title: &str) -> Vec<String> {
    let mut header: Vec<char> = format!("    {title}").chars().collect();
    header.resize(RULE.len(), ' ');
    let header: String = header
        .into_iter()
        .zip(RULE.chars())
        .map(|(c, r)| if c == ' ' { r } else { c })
        .collect();

    let mut out = vec![header];
    for &task in list {
        dump_task(graph, task, "", &mut out);
    }
    out.push(RULE.to_string());
    out
}

/// Emit [`dump_list`] to the diagnostics sink.
pub fn log_list(graph: &TaskGraph, list: &[Option<TaskId>], title: &str) {
    for line in dump_list(graph, list, title) {
        tracing::info!(target: "rasterflow::dump", "{line}");
    }
}
