//! Variable inspection: locals and user watches rendered into trees of [`WatchItem`].
pub mod dumper;
pub mod format;
pub mod value;

use crate::debugger::backend::FrameRef;
use crate::debugger::config::InspectionSection;
use crate::debugger::error::Error;
use crate::debugger::variable::dumper::{
    normalize_type_name, DumpContext, DumperRegistry, MemoryReader, Rendered,
};
use crate::debugger::variable::format::{FormatHint, NumericBase};
use crate::debugger::variable::value::Variable;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Backend queries the pipeline needs.
pub trait InspectionSource: MemoryReader {
    fn locals(&mut self, frame: FrameRef) -> Result<Vec<Variable>, Error>;

    fn evaluate(&mut self, frame: FrameRef, expression: &str) -> Result<Variable, Error>;

    fn children(&mut self, frame: FrameRef, parent: &Variable) -> Result<Vec<Variable>, Error>;

    fn may_have_side_effects(&self, expression: &str) -> bool;
}

pub const LOCALS_ROOT: &str = "local";
pub const WATCHES_ROOT: &str = "watch";

/// Inspection tree node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WatchItem {
    /// Dotted path, `local.x.y` or `watch.2.0`.
    pub id: String,
    pub name: String,
    pub expression: String,
    pub type_name: String,
    pub value: String,
    pub in_scope: bool,
    pub expandable: bool,
    /// Defined iff expanded while the session is stopped.
    pub children: Option<Vec<WatchItem>>,
    pub format: Option<FormatHint>,
    #[serde(skip)]
    raw: Option<Variable>,
}

impl WatchItem {
    fn out_of_scope(id: String, expression: &str) -> Self {
        Self {
            id,
            name: expression.to_string(),
            expression: expression.to_string(),
            type_name: String::new(),
            value: "<out of scope>".to_string(),
            in_scope: false,
            expandable: false,
            children: None,
            format: None,
            raw: None,
        }
    }

    fn not_evaluated(id: String, expression: &str) -> Self {
        Self {
            value: "<not evaluated>".to_string(),
            ..Self::out_of_scope(id, expression)
        }
    }

    /// Raw backend value this item was rendered from.
    pub fn raw(&self) -> Option<&Variable> {
        self.raw.as_ref()
    }

    fn drop_children(&mut self) {
        self.children = None;
    }
}

fn find_in<'a>(items: &'a [WatchItem], id: &str) -> Option<&'a WatchItem> {
    for item in items {
        if item.id == id {
            return Some(item);
        }
        if id.starts_with(&item.id) && id[item.id.len()..].starts_with('.') {
            return item.children.as_deref().and_then(|c| find_in(c, id));
        }
    }
    None
}

fn find_in_mut<'a>(items: &'a mut [WatchItem], id: &str) -> Option<&'a mut WatchItem> {
    for item in items {
        if item.id == id {
            return Some(item);
        }
        if id.starts_with(&item.id) && id[item.id.len()..].starts_with('.') {
            return item
                .children
                .as_deref_mut()
                .and_then(|c| find_in_mut(c, id));
        }
    }
    None
}

fn for_each_mut(items: &mut [WatchItem], f: &mut dyn FnMut(&mut WatchItem)) {
    for item in items {
        f(item);
        if let Some(children) = item.children.as_deref_mut() {
            for_each_mut(children, f);
        }
    }
}

/// Id segment for a member name: `[3]` becomes `3`, dots are not allowed inside a segment.
fn id_segment(name: &str) -> String {
    name.trim_matches(|c| c == '[' || c == ']')
        .replace('.', "_")
        .replace(' ', "")
}

struct UserWatch {
    number: u32,
    expression: String,
    item: WatchItem,
}

pub struct InspectionPipeline {
    registry: DumperRegistry,
    /// Sticky format hints by normalized type name.
    formats: HashMap<String, FormatHint>,
    locals: Vec<WatchItem>,
    watches: Vec<UserWatch>,
    next_watch: u32,
    /// Ids the user expanded, parents sort before their children.
    expanded: BTreeSet<String>,
    frame: Option<FrameRef>,
    max_children: usize,
    max_string_length: usize,
    default_base: NumericBase,
}

impl InspectionPipeline {
    pub fn new(registry: DumperRegistry, config: &InspectionSection) -> Self {
        Self {
            registry,
            formats: HashMap::new(),
            locals: vec![],
            watches: vec![],
            next_watch: 0,
            expanded: BTreeSet::new(),
            frame: None,
            max_children: config.max_children,
            max_string_length: config.max_string_length,
            default_base: config.default_base,
        }
    }

    pub fn registry_mut(&mut self) -> &mut DumperRegistry {
        &mut self.registry
    }

    pub fn locals(&self) -> &[WatchItem] {
        &self.locals
    }

    pub fn watches(&self) -> impl Iterator<Item = &WatchItem> {
        self.watches.iter().map(|w| &w.item)
    }

    /// All roots, locals first.
    pub fn roots(&self) -> Vec<WatchItem> {
        self.locals
            .iter()
            .cloned()
            .chain(self.watches().cloned())
            .collect()
    }

    pub fn find(&self, id: &str) -> Option<&WatchItem> {
        find_in(&self.locals, id).or_else(|| {
            self.watches
                .iter()
                .find_map(|w| find_in(std::slice::from_ref(&w.item), id))
        })
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut WatchItem> {
        if id.starts_with(WATCHES_ROOT) {
            return self
                .watches
                .iter_mut()
                .find_map(|w| find_in_mut(std::slice::from_mut(&mut w.item), id));
        }
        find_in_mut(&mut self.locals, id)
    }

    pub fn is_expanded(&self, id: &str) -> bool {
        self.expanded.contains(id)
    }

    pub fn format_for(&self, type_name: &str) -> Option<FormatHint> {
        self.formats.get(&normalize_type_name(type_name)).copied()
    }

    fn render<S: InspectionSource>(
        &self,
        src: &mut S,
        id: String,
        var: Variable,
    ) -> Result<WatchItem, Error> {
        let hint = self.format_for(&var.type_name);
        let dumper = self.registry.lookup(&var, hint);
        let mut ctx = DumpContext {
            memory: src,
            hint,
            default_base: self.default_base,
            max_string_length: self.max_string_length,
        };
        let rendered = match dumper.render(&var, &mut ctx) {
            Ok(rendered) => rendered,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => Rendered {
                value: format!("<error: {e}>"),
                expandable: false,
            },
        };

        Ok(WatchItem {
            id,
            name: var.name.clone(),
            expression: var.expression.clone(),
            type_name: var.type_name.clone(),
            value: rendered.value,
            in_scope: true,
            expandable: rendered.expandable,
            children: None,
            format: hint,
            raw: Some(var),
        })
    }

    fn evaluate_watch<S: InspectionSource>(
        &self,
        src: &mut S,
        frame: FrameRef,
        number: u32,
        expression: &str,
    ) -> Result<WatchItem, Error> {
        let id = format!("{WATCHES_ROOT}.{number}");
        match src.evaluate(frame, expression) {
            Ok(var) => {
                let mut item = self.render(src, id, var)?;
                item.name = expression.to_string();
                item.expression = expression.to_string();
                Ok(item)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(target: "inspect", "watch `{expression}` out of scope: {e}");
                Ok(WatchItem::out_of_scope(id, expression))
            }
        }
    }

    /// Rebuild locals and re-resolve watches for `frame` (on stop or on frame/thread switch).
    /// Previously expanded nodes are expanded again. Returns the new roots.
    pub fn rebuild<S: InspectionSource>(
        &mut self,
        src: &mut S,
        frame: FrameRef,
    ) -> Result<Vec<WatchItem>, Error> {
        self.frame = Some(frame);

        let vars = match src.locals(frame) {
            Ok(vars) => vars,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!(target: "inspect", "no locals in {frame:?}: {e}");
                vec![]
            }
        };

        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut locals = Vec::with_capacity(vars.len());
        for var in vars {
            let segment = id_segment(&var.name);
            let n = seen.entry(segment.clone()).or_default();
            *n += 1;
            let id = if *n == 1 {
                format!("{LOCALS_ROOT}.{segment}")
            } else {
                format!("{LOCALS_ROOT}.{segment}@{n}")
            };
            locals.push(self.render(src, id, var)?);
        }
        self.locals = locals;

        for i in 0..self.watches.len() {
            let (number, expression) = (self.watches[i].number, self.watches[i].expression.clone());
            let item = self.evaluate_watch(src, frame, number, &expression)?;
            self.watches[i].item = item;
        }

        for id in self.expanded.clone() {
            let expandable = self.find(&id).map(|item| item.expandable).unwrap_or(false);
            if expandable {
                match self.expand(src, &id) {
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!(target: "inspect", "re-expand {id}: {e}"),
                    Ok(_) => {}
                }
            }
        }

        Ok(self.roots())
    }

    /// Debuggee resumed: children are only defined while stopped.
    pub fn invalidate(&mut self) {
        for_each_mut(&mut self.locals, &mut WatchItem::drop_children);
        for w in self.watches.iter_mut() {
            for_each_mut(std::slice::from_mut(&mut w.item), &mut WatchItem::drop_children);
        }
    }

    /// Debuggee is gone.
    pub fn clear(&mut self) {
        self.locals.clear();
        self.frame = None;
        for w in self.watches.iter_mut() {
            w.item = WatchItem::out_of_scope(w.item.id.clone(), &w.expression);
        }
    }

    /// Add a user watch. It is evaluated at once when `evaluate_now` (the session is stopped).
    pub fn add_watch<S: InspectionSource>(
        &mut self,
        src: &mut S,
        expression: &str,
        force: bool,
        evaluate_now: bool,
    ) -> Result<WatchItem, Error> {
        let expression = expression.trim();
        if !force && src.may_have_side_effects(expression) {
            return Err(Error::SideEffectRefused {
                expression: expression.to_string(),
            });
        }

        self.next_watch += 1;
        let number = self.next_watch;
        let item = match (evaluate_now, self.frame) {
            (true, Some(frame)) => self.evaluate_watch(src, frame, number, expression)?,
            _ => WatchItem::not_evaluated(format!("{WATCHES_ROOT}.{number}"), expression),
        };
        self.watches.push(UserWatch {
            number,
            expression: expression.to_string(),
            item: item.clone(),
        });
        Ok(item)
    }

    pub fn remove_watch(&mut self, id: &str) -> Result<(), Error> {
        let pos = self
            .watches
            .iter()
            .position(|w| w.item.id == id)
            .ok_or_else(|| Error::NotFound(format!("watch {id}")))?;
        self.watches.remove(pos);
        let prefix = format!("{id}.");
        self.expanded
            .retain(|e| e != id && !e.starts_with(&prefix));
        Ok(())
    }

    /// Populate one level of children. Expanding an expanded node returns the cached children.
    pub fn expand<S: InspectionSource>(
        &mut self,
        src: &mut S,
        id: &str,
    ) -> Result<Vec<WatchItem>, Error> {
        let item = self
            .find(id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        if let Some(children) = &item.children {
            return Ok(children.clone());
        }
        let Some(frame) = self.frame else {
            return Err(Error::NotFound(format!("frame for watch item {id}")));
        };

        let mut children = vec![];
        if item.expandable {
            if let Some(raw) = item.raw.clone() {
                let vars = src.children(frame, &raw)?;
                for var in vars.into_iter().take(self.max_children) {
                    let child_id = format!("{id}.{}", id_segment(&var.name));
                    children.push(self.render(src, child_id, var)?);
                }
            }
        }

        if let Some(item) = self.find_mut(id) {
            item.children = Some(children.clone());
        }
        self.expanded.insert(id.to_string());
        Ok(children)
    }

    pub fn collapse(&mut self, id: &str) -> Result<(), Error> {
        let item = self
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        item.children = None;
        let prefix = format!("{id}.");
        self.expanded
            .retain(|e| e != id && !e.starts_with(&prefix));
        Ok(())
    }

    /// Set (or reset with `None`) the format of every value of `type_name` and re-render them.
    pub fn set_format<S: InspectionSource>(
        &mut self,
        src: &mut S,
        type_name: &str,
        hint: Option<FormatHint>,
    ) -> Result<Vec<WatchItem>, Error> {
        let key = normalize_type_name(type_name);
        match hint {
            Some(hint) => self.formats.insert(key.clone(), hint),
            None => self.formats.remove(&key),
        };

        // collect first, rendering needs the registry while the trees are borrowed
        let mut targets = vec![];
        let mut collect = |item: &mut WatchItem| {
            if normalize_type_name(&item.type_name) == key {
                if let Some(raw) = item.raw.clone() {
                    targets.push((item.id.clone(), raw));
                }
            }
        };
        for_each_mut(&mut self.locals, &mut collect);
        for w in self.watches.iter_mut() {
            for_each_mut(std::slice::from_mut(&mut w.item), &mut collect);
        }

        for (id, raw) in targets {
            let rendered = self.render(src, id.clone(), raw)?;
            if let Some(item) = self.find_mut(&id) {
                item.value = rendered.value;
                item.expandable = rendered.expandable;
                item.format = rendered.format;
                if !item.expandable {
                    item.children = None;
                }
            }
        }
        Ok(self.roots())
    }

    /// One-shot evaluation (tooltips), nothing is stored.
    pub fn evaluate<S: InspectionSource>(
        &self,
        src: &mut S,
        frame: FrameRef,
        expression: &str,
        force: bool,
    ) -> Result<WatchItem, Error> {
        if !force && src.may_have_side_effects(expression) {
            return Err(Error::SideEffectRefused {
                expression: expression.to_string(),
            });
        }
        let var = src.evaluate(frame, expression)?;
        self.render(src, "eval".to_string(), var)
    }
}
