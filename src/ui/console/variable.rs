use crate::debugger::WatchItem;
use crate::ui::console::print::style::KeywordView;

const TAB: &str = "\t";

/// Render an inspection tree item with its expanded children, one item per line.
pub fn render_watch_item(item: &WatchItem, depth: usize) -> String {
    let tabs = TAB.repeat(depth);
    let type_name = if item.type_name.is_empty() {
        String::new()
    } else {
        format!(": {}", item.type_name)
    };
    let collapsed = if item.expandable && item.children.is_none() {
        " {..}"
    } else {
        ""
    };

    let mut render = format!(
        "{tabs}{}{type_name} = {}{collapsed} [{}]",
        KeywordView::from(&item.name),
        item.value,
        item.id
    );
    if let Some(children) = &item.children {
        for child in children {
            render = format!("{render}\n{}", render_watch_item(child, depth + 1));
        }
    }
    render
}
