/// Slide-format parser for column include files.
///
/// Column include files use a presentation format where entries are separated
/// by a `---` line (with surrounding blank lines). Each slide becomes one Task:
/// the first non-empty line is the title, the rest is the description.
///
/// ```text
/// # slide 1 title
///
/// slide 1 content
///
/// ---
///
/// # slide 2 title
/// ```
use crate::types::Task;

/// Parse slide-format content into tasks.
pub fn parse_slides(content: &str) -> Vec<Task> {
    let content = content.replace("\r\n", "\n").replace('\r', "\n");

    if content.trim().is_empty() {
        return Vec::new();
    }

    split_slides(&content)
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .map(|slide| slide_to_task(slide.trim()))
        .collect()
}

fn slide_to_task(slide: &str) -> Task {
    let mut lines = slide.splitn(2, '\n');
    let title = lines.next().unwrap_or("").trim().to_string();
    let description = lines.next().unwrap_or("").trim().to_string();
    Task::new(title, description)
}

/// Split content by slide separator `---` on its own line with surrounding blank lines.
fn split_slides(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut slides = Vec::new();
    let mut current_lines: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        if lines[i].trim() == "---" {
            let prev_blank = current_lines
                .last()
                .map_or(true, |l| l.trim().is_empty());
            let next_blank = lines.get(i + 1).map_or(true, |l| l.trim().is_empty());

            if prev_blank || next_blank {
                while current_lines.last().is_some_and(|l| l.trim().is_empty()) {
                    current_lines.pop();
                }
                slides.push(current_lines.join("\n"));
                current_lines.clear();

                if next_blank && i + 1 < lines.len() {
                    i += 1;
                }
                i += 1;
                continue;
            }
        }

        current_lines.push(lines[i]);
        i += 1;
    }

    while current_lines.last().is_some_and(|l| l.trim().is_empty()) {
        current_lines.pop();
    }
    if !current_lines.is_empty() {
        slides.push(current_lines.join("\n"));
    }

    slides
}

/// Generate slide-format content from tasks.
pub fn generate_slides(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return String::new();
    }

    let slides: Vec<String> = tasks
        .iter()
        .map(|task| {
            if task.description.trim().is_empty() {
                task.title.clone()
            } else {
                format!("{}\n\n{}", task.title, task.description)
            }
        })
        .collect();

    let mut output = slides.join("\n\n---\n\n");
    output.push('\n');
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_slide() {
        let tasks = parse_slides("# slide 1 title\n\nslide 1 content\n");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "# slide 1 title");
        assert_eq!(tasks[0].description, "slide 1 content");
    }

    #[test]
    fn test_parse_two_slides() {
        let content =
            "# slide 1 title\n\nslide 1 content\n\n---\n\n# slide 2 title\n\nslide 2 content\n";
        let tasks = parse_slides(content);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].title, "# slide 2 title");
        assert_eq!(tasks[1].description, "slide 2 content");
    }

    #[test]
    fn test_dash_line_inside_text_is_not_a_separator() {
        let tasks = parse_slides("title\nabove\n---\nbelow\n");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "above\n---\nbelow");
    }

    #[test]
    fn test_parse_empty_content() {
        assert!(parse_slides("").is_empty());
        assert!(parse_slides("   \n  \n").is_empty());
    }

    #[test]
    fn test_generate_slides() {
        let tasks = vec![
            Task::new("# Slide 1", "content 1"),
            Task::new("# Slide 2", ""),
        ];
        assert_eq!(
            generate_slides(&tasks),
            "# Slide 1\n\ncontent 1\n\n---\n\n# Slide 2\n"
        );
        assert_eq!(generate_slides(&[]), "");
    }

    #[test]
    fn test_generated_slides_parse_back() {
        let content = "# Slide 1\n\ncontent 1\n\n---\n\n# Slide 2\n\ncontent 2\n";
        let tasks = parse_slides(content);
        assert_eq!(generate_slides(&tasks), content);
    }
}
