use crate::dom::{DocumentTree, NodeId};

/// A compound selector: `tag#id.class[attr="value"]:nth-child(k)`, every part optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Compound {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: Vec<(String, String)>,
    /// Counted among same-tag siblings from 1, like [`PathSegment::Tag`].
    pub nth: Option<usize>,
}

impl Compound {
    fn matches<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        self.tag.as_ref().map_or(true, |tag| doc.tag_name(node) == *tag)
            && self
                .id
                .as_ref()
                .map_or(true, |id| doc.attribute(node, "id").as_deref() == Some(id.as_str()))
            && (self.classes.is_empty() || has_classes(doc, node, &self.classes))
            && self
                .attributes
                .iter()
                .all(|(name, value)| doc.attribute(node, name).as_deref() == Some(value.as_str()))
            && self.nth.map_or(true, |k| same_tag_index(doc, node).0 == k)
    }

    fn render(&self, nth_pseudo: &str) -> String {
        let mut out = self.tag.clone().unwrap_or_default();
        if let Some(id) = &self.id {
            out.push('#');
            out.push_str(id);
        }
        for class in &self.classes {
            out.push('.');
            out.push_str(class);
        }
        for (name, value) in &self.attributes {
            out.push_str(&format!("[{name}=\"{}\"]", escape_quoted(value)));
        }
        if let Some(k) = self.nth {
            out.push_str(&format!(":{nth_pseudo}({k})"));
        }
        if out.is_empty() {
            out.push('*');
        }
        out
    }
}

/// One level of a positional path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// `#id`
    Id(String),
    /// `tag` or `tag:nth-child(k)`, k counted among same-tag siblings from 1
    Tag { tag: String, nth: Option<usize> },
    /// Anything else a segment can hold, e.g. `div.item` or `input[name="q"]`
    Compound(Compound),
}

/// Represents ways to locate an element in a document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// `#id`
    Id(String),
    /// `[name="value"]`
    Attribute { name: String, value: String },
    /// `.a.b`, every listed class must be present
    Classes(Vec<String>),
    /// `tag:contains("text")`
    TagText { tag: String, text: String },
    /// `seg > seg > ...`
    Path(Vec<PathSegment>),
    /// `a b c`: each part matches an ancestor of what the next part matched
    Descendant(Vec<Selector>),
    /// Represents an invalid selector string, with a reason.
    Invalid(String),
}

impl Selector {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Selector::Invalid(_))
    }

    /// Whether `node` is matched by this selector.
    pub fn matches<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> bool {
        match self {
            Selector::Id(id) => doc.attribute(node, "id").as_deref() == Some(id.as_str()),
            Selector::Attribute { name, value } => {
                doc.attribute(node, name).as_deref() == Some(value.as_str())
            }
            Selector::Classes(classes) => !classes.is_empty() && has_classes(doc, node, classes),
            Selector::TagText { tag, text } => {
                doc.tag_name(node) == *tag && doc.text_content(node).trim().contains(text.as_str())
            }
            Selector::Path(segments) => {
                let mut current = Some(node);
                for segment in segments.iter().rev() {
                    match current {
                        Some(n) if segment_matches(doc, segment, n) => current = doc.parent(n),
                        _ => return false,
                    }
                }
                !segments.is_empty()
            }
            Selector::Descendant(parts) => {
                let Some((last, ancestors)) = parts.split_last() else {
                    return false;
                };
                if !last.matches(doc, node) {
                    return false;
                }
                // The nearest matching ancestor always leaves the most room above it.
                let mut top = last.top_of(doc, node);
                for part in ancestors.iter().rev() {
                    let mut candidate = top.and_then(|n| doc.parent(n));
                    loop {
                        match candidate {
                            Some(n) if part.matches(doc, n) => {
                                top = part.top_of(doc, n);
                                break;
                            }
                            Some(n) => candidate = doc.parent(n),
                            None => return false,
                        }
                    }
                }
                true
            }
            Selector::Invalid(_) => false,
        }
    }

    // Highest node covered when this selector matched `node`.
    fn top_of<D: DocumentTree + ?Sized>(&self, doc: &D, node: NodeId) -> Option<NodeId> {
        let levels = match self {
            Selector::Path(segments) => segments.len().saturating_sub(1),
            _ => 0,
        };
        (0..levels).try_fold(node, |n, _| doc.parent(n))
    }

    /// Renders the selector for a standards-compliant engine: positional segments
    /// use `:nth-of-type`. `None` for text predicates, which CSS cannot express.
    pub fn to_css(&self) -> Option<String> {
        match self {
            Selector::Path(segments) => Some(
                segments
                    .iter()
                    .map(|s| match s {
                        PathSegment::Tag { tag, nth: Some(k) } => format!("{tag}:nth-of-type({k})"),
                        PathSegment::Compound(compound) => compound.render("nth-of-type"),
                        other => render_segment(other),
                    })
                    .collect::<Vec<_>>()
                    .join(" > "),
            ),
            Selector::Descendant(parts) => parts
                .iter()
                .map(Selector::to_css)
                .collect::<Option<Vec<_>>>()
                .map(|parts| parts.join(" ")),
            Selector::TagText { .. } | Selector::Invalid(_) => None,
            other => Some(other.to_string()),
        }
    }
}

/// 1-based index of `node` among its siblings sharing its tag.
pub fn same_tag_index<D: DocumentTree + ?Sized>(doc: &D, node: NodeId) -> (usize, usize) {
    let tag = doc.tag_name(node);
    let Some(parent) = doc.parent(node) else {
        return (1, 1);
    };
    let siblings: Vec<NodeId> = doc
        .children(parent)
        .into_iter()
        .filter(|&n| doc.tag_name(n) == tag)
        .collect();
    let index = siblings.iter().position(|&n| n == node).unwrap_or(0) + 1;
    (index, siblings.len())
}

/// Whether `s` can be written as a bare id, class or attribute name.
pub fn is_ident(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

fn has_classes<D: DocumentTree + ?Sized>(doc: &D, node: NodeId, classes: &[String]) -> bool {
    let Some(list) = doc.attribute(node, "class") else {
        return false;
    };
    let present: Vec<&str> = list.split_whitespace().collect();
    classes.iter().all(|c| present.contains(&c.as_str()))
}

fn segment_matches<D: DocumentTree + ?Sized>(doc: &D, segment: &PathSegment, node: NodeId) -> bool {
    match segment {
        PathSegment::Id(id) => doc.attribute(node, "id").as_deref() == Some(id.as_str()),
        PathSegment::Tag { tag, nth } => {
            if doc.tag_name(node) != *tag {
                return false;
            }
            match nth {
                Some(k) => same_tag_index(doc, node).0 == *k,
                None => true,
            }
        }
        PathSegment::Compound(compound) => compound.matches(doc, node),
    }
}

fn render_segment(segment: &PathSegment) -> String {
    match segment {
        PathSegment::Id(id) => format!("#{id}"),
        PathSegment::Tag { tag, nth: None } => tag.clone(),
        PathSegment::Tag { tag, nth: Some(k) } => format!("{tag}:nth-child({k})"),
        PathSegment::Compound(compound) => compound.render("nth-child"),
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unquote(raw: &str) -> Option<String> {
    let inner = raw.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Splits on `is_separator` outside quotes, brackets and parentheses.
fn split_outside(s: &str, is_separator: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '[' | '(' if !in_quotes => depth += 1,
            ']' | ')' if !in_quotes => depth = depth.saturating_sub(1),
            c if !in_quotes && depth == 0 && is_separator(c) => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn is_tag_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

// Byte index of the `]` closing the bracket `s` starts with.
fn closing_bracket(s: &str) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ']' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn take_ident(s: &str) -> (&str, &str) {
    let end = s
        .find(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(s.len());
    s.split_at(end)
}

/// `name="value"` (or an unquoted value) from inside `[...]`.
fn parse_attribute(body: &str, source: &str) -> Result<(String, String), String> {
    let Some((name, raw)) = body.split_once('=') else {
        return Err(format!("attribute selector without value `{source}`"));
    };
    let name = name.trim();
    if !is_ident(name) {
        return Err(format!("bad attribute name in `{source}`"));
    }
    let raw = raw.trim();
    let value = match unquote(raw) {
        Some(value) => value,
        None if is_ident(raw) => raw.to_string(),
        None => return Err(format!("bad attribute value in `{source}`")),
    };
    Ok((name.to_string(), value))
}

fn parse_nth<'a>(rest: &'a str, source: &str) -> Result<(usize, &'a str), String> {
    let args = rest
        .strip_prefix("nth-child(")
        .or_else(|| rest.strip_prefix("nth-of-type("))
        .ok_or_else(|| format!("unsupported pseudo-class in `{source}`"))?;
    let (k, rest) = args
        .split_once(')')
        .ok_or_else(|| format!("unclosed pseudo-class in `{source}`"))?;
    let k = k
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|k| *k > 0)
        .ok_or_else(|| format!("bad nth-child in `{source}`"))?;
    Ok((k, rest))
}

fn parse_compound(s: &str) -> Result<Compound, String> {
    let mut compound = Compound::default();
    let mut rest = s;
    if let Some(after) = rest.strip_prefix('*') {
        rest = after;
    } else {
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or(rest.len());
        if end > 0 {
            let tag = &rest[..end];
            if !is_tag_name(tag) {
                return Err(format!("bad tag in `{s}`"));
            }
            compound.tag = Some(tag.to_lowercase());
            rest = &rest[end..];
        }
    }

    while let Some(c) = rest.chars().next() {
        match c {
            '#' | '.' => {
                let (ident, after) = take_ident(&rest[1..]);
                if !is_ident(ident) {
                    return Err(format!("bad `{c}` part in `{s}`"));
                }
                if c == '.' {
                    compound.classes.push(ident.to_string());
                } else if compound.id.replace(ident.to_string()).is_some() {
                    return Err(format!("two ids in `{s}`"));
                }
                rest = after;
            }
            '[' => {
                let close = closing_bracket(rest).ok_or_else(|| format!("unclosed `[` in `{s}`"))?;
                compound.attributes.push(parse_attribute(&rest[1..close], s)?);
                rest = &rest[close + 1..];
            }
            ':' => {
                let (k, after) = parse_nth(&rest[1..], s)?;
                if compound.nth.replace(k).is_some() {
                    return Err(format!("two positions in `{s}`"));
                }
                rest = after;
            }
            other => return Err(format!("unexpected `{other}` in `{s}`")),
        }
    }

    if compound == Compound::default() && s != "*" {
        return Err(format!("empty selector part `{s}`"));
    }
    Ok(compound)
}

fn into_segment(compound: Compound) -> PathSegment {
    let plain = compound.classes.is_empty() && compound.attributes.is_empty();
    match compound {
        Compound {
            tag: None,
            id: Some(id),
            nth: None,
            ..
        } if plain => PathSegment::Id(id),
        Compound {
            tag: Some(tag),
            id: None,
            nth,
            ..
        } if plain => PathSegment::Tag { tag, nth },
        other => PathSegment::Compound(other),
    }
}

fn parse_segment(s: &str) -> Result<PathSegment, String> {
    parse_compound(s).map(into_segment)
}

fn parse_simple(s: &str) -> Result<Selector, String> {
    if let Some((tag, rest)) = s.split_once(":contains(") {
        let text = rest
            .strip_suffix(')')
            .and_then(|r| unquote(r.trim()))
            .ok_or_else(|| format!("bad :contains predicate `{s}`"))?;
        if !is_tag_name(tag) {
            return Err(format!("bad tag in `{s}`"));
        }
        return Ok(Selector::TagText {
            tag: tag.to_lowercase(),
            text,
        });
    }

    let compound = parse_compound(s)?;
    let bare = compound.tag.is_none() && compound.nth.is_none();
    let has_id = compound.id.is_some();
    let (classes, attributes) = (compound.classes.len(), compound.attributes.len());
    Ok(match compound {
        Compound { id: Some(id), .. } if bare && classes == 0 && attributes == 0 => {
            Selector::Id(id)
        }
        Compound {
            attributes: mut list,
            ..
        } if bare && !has_id && classes == 0 && attributes == 1 => {
            let (name, value) = list.remove(0);
            Selector::Attribute { name, value }
        }
        Compound { classes: list, .. } if bare && !has_id && attributes == 0 && classes > 0 => {
            Selector::Classes(list)
        }
        other => Selector::Path(vec![into_segment(other)]),
    })
}

fn parse_group(group: &[&str]) -> Result<Selector, String> {
    if let [single] = group {
        return parse_simple(single);
    }
    group
        .iter()
        .map(|segment| parse_segment(segment))
        .collect::<Result<Vec<_>, _>>()
        .map(Selector::Path)
}

fn parse_selector(s: &str) -> Result<Selector, String> {
    // Compounds joined by `>` form one group, whitespace starts a new group.
    let mut groups: Vec<Vec<&str>> = Vec::new();
    for (i, part) in split_outside(s, |c| c == '>').into_iter().enumerate() {
        let words: Vec<&str> = split_outside(part, char::is_whitespace)
            .into_iter()
            .filter(|w| !w.is_empty())
            .collect();
        let Some((&first, rest)) = words.split_first() else {
            return Err(format!("dangling `>` in `{s}`"));
        };
        if i == 0 {
            groups.push(vec![first]);
        } else if let Some(group) = groups.last_mut() {
            group.push(first);
        }
        groups.extend(rest.iter().map(|&word| vec![word]));
    }

    let mut parts = groups
        .iter()
        .map(|group| parse_group(group))
        .collect::<Result<Vec<_>, _>>()?;
    if parts.len() == 1 {
        return Ok(parts.remove(0));
    }
    if parts.iter().any(|p| matches!(p, Selector::TagText { .. })) {
        return Err(format!("`:contains` cannot be combined with other parts in `{s}`"));
    }
    Ok(Selector::Descendant(parts))
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Id(id) => write!(f, "#{id}"),
            Selector::Attribute { name, value } => {
                write!(f, "[{name}=\"{}\"]", escape_quoted(value))
            }
            Selector::Classes(classes) => write!(f, ".{}", classes.join(".")),
            Selector::TagText { tag, text } => {
                write!(f, "{tag}:contains(\"{}\")", escape_quoted(text))
            }
            Selector::Path(segments) => {
                let rendered: Vec<String> = segments.iter().map(render_segment).collect();
                f.write_str(&rendered.join(" > "))
            }
            Selector::Descendant(parts) => {
                let rendered: Vec<String> = parts.iter().map(Selector::to_string).collect();
                f.write_str(&rendered.join(" "))
            }
            Selector::Invalid(reason) => write!(f, "<invalid: {reason}>"),
        }
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Selector::Invalid("empty selector".to_string());
        }
        parse_selector(s).unwrap_or_else(Selector::Invalid)
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}
