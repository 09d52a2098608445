//! In-memory element tree.
//!
//! Nodes live in an arena addressed by [`NodeId`]; the root element is
//! always node 0. Reading and writing markup goes through `quick-xml`.

use std::io::Write;

use anyhow::{Context, Result, anyhow, bail};
use quick_xml::{
    Reader, Writer,
    escape::{resolve_predefined_entity, unescape},
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};

pub type NodeId = usize;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
}

impl Element {
    fn new(name: &str, parent: Option<NodeId>) -> Self {
        Element {
            name: name.to_string(),
            parent,
            ..Element::default()
        }
    }

    /// Matches `name` against the qualified name, or against the local part
    /// when `name` carries no prefix.
    pub fn is_named(&self, name: &str) -> bool {
        if self.name == name {
            return true;
        }
        !name.contains(':')
            && self
                .name
                .split_once(':')
                .is_some_and(|(_, local)| local == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name || key.rsplit(':').next() == Some(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    nodes: Vec<Element>,
}

impl Document {
    pub fn new(root_name: &str) -> Self {
        Document {
            nodes: vec![Element::new(root_name, None)],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn root_name(&self) -> &str {
        &self.nodes[0].name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1 && self.nodes[0].text.is_empty() && self.nodes[0].attributes.is_empty()
    }

    pub fn element(&self, id: NodeId) -> &Element {
        &self.nodes[id]
    }

    pub fn append_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Element::new(name, Some(parent)));
        self.nodes[parent].children.push(id);
        id
    }

    pub fn children_named<'a>(
        &'a self,
        parent: NodeId,
        name: &'a str,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes[parent]
            .children
            .iter()
            .copied()
            .filter(move |child| self.nodes[*child].is_named(name))
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id].attribute(name)
    }

    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        let attributes = &mut self.nodes[id].attributes;
        match attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn text(&self, id: NodeId) -> &str {
        &self.nodes[id].text
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        self.nodes[id].text = text.to_string();
    }

    pub fn rename_root(&mut self, name: &str) {
        self.nodes[0].name = name.to_string();
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().expand_empty_elements = true;
        let mut document: Option<Document> = None;
        let mut stack: Vec<NodeId> = Vec::new();
        loop {
            let position = reader.buffer_position();
            let event = reader
                .read_event()
                .with_context(|| format!("Parsing markup near byte {position}"))?;
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    let id = match (document.as_mut(), stack.last()) {
                        (Some(doc), Some(&parent)) => doc.append_child(parent, &name),
                        (None, _) => {
                            document = Some(Document::new(&name));
                            0
                        }
                        (Some(_), None) => bail!("Document has more than one root element"),
                    };
                    let doc = document
                        .as_mut()
                        .ok_or_else(|| anyhow!("Document root missing"))?;
                    for attribute in start.attributes() {
                        let attribute = attribute.context("Reading attribute")?;
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                        let value = raw_attribute(&attribute.value)?;
                        doc.nodes[id].attributes.push((key, value));
                    }
                    stack.push(id);
                }
                Event::End(_) => {
                    if let (Some(doc), Some(id)) = (document.as_mut(), stack.pop()) {
                        let node = &mut doc.nodes[id];
                        if !node.children.is_empty() && node.text.trim().is_empty() {
                            node.text.clear();
                        }
                    }
                }
                Event::Text(text) => {
                    if let (Some(doc), Some(&id)) = (document.as_mut(), stack.last()) {
                        doc.nodes[id]
                            .text
                            .push_str(&String::from_utf8_lossy(&text.into_inner()));
                    }
                }
                Event::CData(data) => {
                    if let (Some(doc), Some(&id)) = (document.as_mut(), stack.last()) {
                        doc.nodes[id]
                            .text
                            .push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::GeneralRef(reference) => {
                    if let (Some(doc), Some(&id)) = (document.as_mut(), stack.last()) {
                        let name = String::from_utf8_lossy(&reference.into_inner()).into_owned();
                        let resolved = resolve_reference(&name)
                            .ok_or_else(|| anyhow!("Unknown entity '&{name};'"))?;
                        doc.nodes[id].text.push_str(&resolved);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if !stack.is_empty() {
            bail!("Document ended inside an open element");
        }
        document.ok_or_else(|| anyhow!("Document has no root element"))
    }

    /// Serializes the tree with an XML declaration naming `encoding`.
    pub fn to_xml_string(&self, indent: usize, encoding: &str) -> Result<String> {
        let buffer = if indent == 0 {
            let mut writer = Writer::new(Vec::new());
            self.write_all(&mut writer, encoding)?;
            writer.into_inner()
        } else {
            let mut writer = Writer::new_with_indent(Vec::new(), b' ', indent);
            self.write_all(&mut writer, encoding)?;
            writer.into_inner()
        };
        String::from_utf8(buffer).context("Serialized markup is not valid UTF-8")
    }

    fn write_all<W: Write>(&self, writer: &mut Writer<W>, encoding: &str) -> Result<()> {
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some(encoding), None)))
            .context("Writing declaration")?;
        self.write_node(writer, self.root())?;
        writer
            .get_mut()
            .write_all(b"\n")
            .context("Writing trailing newline")
    }

    fn write_node<W: Write>(&self, writer: &mut Writer<W>, id: NodeId) -> Result<()> {
        let node = &self.nodes[id];
        let mut start = BytesStart::new(node.name.as_str());
        for (key, value) in &node.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        if node.children.is_empty() && node.text.is_empty() {
            writer
                .write_event(Event::Empty(start))
                .with_context(|| format!("Writing <{}/>", node.name))?;
            return Ok(());
        }
        writer
            .write_event(Event::Start(start))
            .with_context(|| format!("Writing <{}>", node.name))?;
        if !node.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&node.text)))
                .with_context(|| format!("Writing text of <{}>", node.name))?;
        }
        for child in &node.children {
            self.write_node(writer, *child)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(node.name.as_str())))
            .with_context(|| format!("Writing </{}>", node.name))?;
        Ok(())
    }
}

fn raw_attribute(value: &[u8]) -> Result<String> {
    let raw = String::from_utf8_lossy(value);
    let unescaped = unescape(&raw).map_err(|err| anyhow!("Invalid attribute value '{raw}': {err}"))?;
    Ok(unescaped.into_owned())
}

fn resolve_reference(name: &str) -> Option<String> {
    if let Some(code) = name.strip_prefix('#') {
        let number = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => code.parse::<u32>().ok()?,
        };
        return char::from_u32(number).map(String::from);
    }
    resolve_predefined_entity(name).map(str::to_string)
}
