/// Lightweight markdown codec for Kanban boards.
///
/// Handles the core format:
///   --- YAML header (must contain kanban-plugin: board) ---
///   ## Column Title
///   - [ ] Task title
///     description line
///   %% footer %%
///
/// Include directives mark a column (tasks come from a presentation file)
/// or a task (description comes from a file). Only the header line of an
/// include column or task is written back to the board file.
use crate::files::BOARD_MARKER;
use crate::include::{slide_parser, syntax};
use crate::types::{generate_id, Board, Column, Task};

/// Converts between board files, presentation files and the in-memory board.
pub trait BoardCodec: Send + Sync {
    fn parse_board(&self, text: &str) -> Board;
    fn generate_board(&self, board: &Board) -> String;
    fn parse_presentation(&self, text: &str) -> Vec<Task>;
    fn generate_presentation(&self, tasks: &[Task]) -> String;
    fn is_valid_board(&self, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownCodec;

impl BoardCodec for MarkdownCodec {
    fn parse_board(&self, text: &str) -> Board {
        parse_markdown(text)
    }

    fn generate_board(&self, board: &Board) -> String {
        generate_markdown(board)
    }

    fn parse_presentation(&self, text: &str) -> Vec<Task> {
        slide_parser::parse_slides(text)
    }

    fn generate_presentation(&self, tasks: &[Task]) -> String {
        slide_parser::generate_slides(tasks)
    }

    fn is_valid_board(&self, text: &str) -> bool {
        parse_markdown(text).valid
    }
}

fn new_column(title: &str) -> Column {
    let include_files = syntax::extract_include_paths(title);
    Column {
        id: generate_id("col"),
        title: title.to_string(),
        tasks: Vec::new(),
        include_mode: !include_files.is_empty(),
        include_files,
        include_error: false,
    }
}

fn new_task(title: &str, checked: bool) -> Task {
    let include_files = syntax::extract_include_paths(title);
    let include_mode = !include_files.is_empty();
    Task {
        id: generate_id("task"),
        title: title.to_string(),
        checked,
        include_mode,
        include_files,
        original_title: include_mode.then(|| title.to_string()),
        ..Task::default()
    }
}

fn push_task(column: Option<&mut Column>, task: Option<Task>, description: &mut Vec<String>) {
    if let (Some(col), Some(mut task)) = (column, task) {
        if !task.include_mode {
            task.description = description.join("\n");
        }
        col.tasks.push(task);
    }
    description.clear();
}

/// Parse kanban markdown content into a board structure.
pub fn parse_markdown(content: &str) -> Board {
    let content = content.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = content.split('\n').collect();

    let mut board = Board::default();
    let mut current_column: Option<Column> = None;
    let mut current_task: Option<Task> = None;
    let mut description: Vec<String> = Vec::new();
    let mut in_yaml_header = false;
    let mut in_kanban_footer = false;
    let mut yaml_lines: Vec<&str> = Vec::new();
    let mut footer_lines: Vec<&str> = Vec::new();
    let mut yaml_start_found = false;

    for (i, &line) in lines.iter().enumerate() {
        if line.starts_with("---") && !in_kanban_footer {
            if !yaml_start_found {
                yaml_start_found = true;
                in_yaml_header = true;
                yaml_lines.push(line);
                continue;
            } else if in_yaml_header {
                yaml_lines.push(line);
                let header = yaml_lines.join("\n");
                board.valid = header.contains(BOARD_MARKER);
                board.yaml_header = Some(header);
                if !board.valid {
                    return board;
                }
                in_yaml_header = false;
                continue;
            }
        }

        if in_yaml_header {
            yaml_lines.push(line);
            continue;
        }

        if line.starts_with("%%") || in_kanban_footer {
            if !in_kanban_footer {
                push_task(current_column.as_mut(), current_task.take(), &mut description);
                in_kanban_footer = true;
            }
            footer_lines.push(line);
            continue;
        }

        if let Some(title) = line.strip_prefix("## ") {
            push_task(current_column.as_mut(), current_task.take(), &mut description);
            if let Some(col) = current_column.take() {
                board.columns.push(col);
            }
            current_column = Some(new_column(title));
            continue;
        }

        if line.starts_with("- ") {
            push_task(current_column.as_mut(), current_task.take(), &mut description);
            if current_column.is_some() {
                let checked = line.starts_with("- [x] ") || line.starts_with("- [X] ");
                let title = line.get(6..).unwrap_or("");
                current_task = Some(new_task(title, checked));
            }
            continue;
        }

        if current_task.is_some() {
            if line.trim().is_empty() && !line.starts_with("  ") {
                // Blank lines before the next structural line belong to nobody
                let next = lines[i + 1..].iter().find(|l| !l.trim().is_empty());
                let at_boundary = next.map_or(true, |l| {
                    l.starts_with("## ")
                        || l.starts_with("- ")
                        || l.starts_with("%%")
                        || l.starts_with("---")
                });
                if at_boundary {
                    continue;
                }
            }
            let desc_line = line.strip_prefix("  ").unwrap_or(line);
            description.push(desc_line.to_string());
        }
    }

    push_task(current_column.as_mut(), current_task.take(), &mut description);
    if let Some(col) = current_column.take() {
        board.columns.push(col);
    }
    if !footer_lines.is_empty() {
        board.kanban_footer = Some(footer_lines.join("\n"));
    }
    board
}

/// Generate markdown from a board structure.
pub fn generate_markdown(board: &Board) -> String {
    let mut markdown = String::new();

    match &board.yaml_header {
        Some(header) if !header.is_empty() => markdown.push_str(header),
        _ => {
            markdown.push_str("---\n");
            markdown.push_str(BOARD_MARKER);
            markdown.push_str("\n---");
        }
    }
    markdown.push_str("\n\n");

    for column in &board.columns {
        markdown.push_str(&format!("## {}\n", column.title));

        // Include columns: tasks live in the include file
        if column.include_mode {
            markdown.push('\n');
            continue;
        }

        for task in &column.tasks {
            let checkbox = if task.checked { "- [x] " } else { "- [ ] " };
            markdown.push_str(checkbox);

            if task.include_mode {
                markdown.push_str(task.original_title.as_deref().unwrap_or(&task.title));
                markdown.push('\n');
                continue;
            }

            let title = task.title.replace("\r\n", "\n");
            let mut title_lines = title.split('\n');
            markdown.push_str(title_lines.next().unwrap_or(""));
            markdown.push('\n');

            let description = task.description.replace("\r\n", "\n");
            let extra = title_lines.chain(description.split('\n').filter(|_| !description.is_empty()));
            for line in extra {
                markdown.push_str("  ");
                markdown.push_str(line);
                markdown.push('\n');
            }
        }

        markdown.push('\n');
    }

    if let Some(footer) = &board.kanban_footer {
        if markdown.ends_with("\n\n") {
            markdown.pop();
        }
        markdown.push_str(footer);
        if !footer.ends_with('\n') {
            markdown.push('\n');
        }
    } else {
        markdown.push('\n');
    }

    markdown
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_BOARD: &str = "\
---
kanban-plugin: board
---

## Todo
- [ ] First task
- [x] Completed task
  with description

## Done
- [x] Finished item

%% kanban:settings
```
```
%%
";

    #[test]
    fn test_parse_basic_board() {
        let board = parse_markdown(SAMPLE_BOARD);
        assert!(board.valid);
        assert_eq!(board.columns.len(), 2);
        assert_eq!(board.columns[0].title, "Todo");
        assert_eq!(board.columns[0].tasks.len(), 2);
        assert!(!board.columns[0].tasks[0].checked);
        assert_eq!(board.columns[0].tasks[0].title, "First task");
        assert_eq!(board.columns[0].tasks[0].description, "");
        assert!(board.columns[0].tasks[1].checked);
        assert_eq!(board.columns[0].tasks[1].description, "with description");
        assert_eq!(board.columns[1].tasks.len(), 1);
        assert!(board.kanban_footer.is_some());
    }

    #[test]
    fn test_parse_invalid_board() {
        let board = parse_markdown("---\ntitle: not a kanban\n---\n## Col\n- [ ] task");
        assert!(!board.valid);
        assert!(!MarkdownCodec.is_valid_board("## Col\n- [ ] task"));
    }

    #[test]
    fn test_roundtrip() {
        let board = parse_markdown(SAMPLE_BOARD);
        let reparsed = parse_markdown(&generate_markdown(&board));

        assert!(reparsed.valid);
        assert_eq!(reparsed.columns.len(), board.columns.len());
        for (orig, re) in board.columns.iter().zip(reparsed.columns.iter()) {
            assert_eq!(orig.title, re.title);
            assert_eq!(orig.tasks.len(), re.tasks.len());
            for (ot, rt) in orig.tasks.iter().zip(re.tasks.iter()) {
                assert_eq!(ot.title, rt.title);
                assert_eq!(ot.description, rt.description);
                assert_eq!(ot.checked, rt.checked);
            }
        }
        assert_eq!(board.kanban_footer, reparsed.kanban_footer);
    }

    #[test]
    fn test_include_column_and_task() {
        let md = "---\nkanban-plugin: board\n---\n\n\
## !!!include(slides.md)!!! Week\n\n\
## Notes\n- [ ] !!!include(notes/idea.md)!!!\n- [ ] Plain\n  see !!!include(ref.md)!!!\n";
        let board = parse_markdown(md);

        let col = &board.columns[0];
        assert!(col.include_mode);
        assert_eq!(col.include_files, vec!["slides.md"]);

        let task = &board.columns[1].tasks[0];
        assert!(task.include_mode);
        assert_eq!(task.include_files, vec!["notes/idea.md"]);
        assert_eq!(task.original_title.as_deref(), Some("!!!include(notes/idea.md)!!!"));

        // A description reference is not an include task
        let plain = &board.columns[1].tasks[1];
        assert!(!plain.include_mode);
        assert_eq!(plain.description, "see !!!include(ref.md)!!!");
    }

    #[test]
    fn test_include_content_not_written_back() {
        let md = "---\nkanban-plugin: board\n---\n\n## !!!include(slides.md)!!!\n\n## Notes\n- [ ] !!!include(idea.md)!!!\n";
        let mut board = parse_markdown(md);
        board.columns[0].tasks.push(Task::new("From slides", "body"));
        board.columns[1].tasks[0].description = "file text".to_string();
        board.columns[1].tasks[0].title = "# include in idea.md".to_string();

        let out = generate_markdown(&board);
        assert!(!out.contains("From slides"));
        assert!(!out.contains("file text"));
        assert!(out.contains("- [ ] !!!include(idea.md)!!!\n"));
    }

    #[test]
    fn test_empty_board() {
        let board = parse_markdown("---\nkanban-plugin: board\n---\n");
        assert!(board.valid);
        assert_eq!(board.columns.len(), 0);
    }

    #[test]
    fn test_description_with_blank_lines() {
        let md = "---\nkanban-plugin: board\n---\n\n## Col\n- [ ] Task\n  line1\n\n  line2\n\n## Next\n";
        let board = parse_markdown(md);
        assert_eq!(board.columns[0].tasks[0].description, "line1\n\nline2");
    }

    #[test]
    fn test_presentation_codec() {
        let tasks = MarkdownCodec.parse_presentation("# One\n\nbody\n\n---\n\n# Two\n");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "# One");
        assert_eq!(tasks[0].description, "body");
        let text = MarkdownCodec.generate_presentation(&tasks);
        assert_eq!(MarkdownCodec.parse_presentation(&text).len(), 2);
    }
}
