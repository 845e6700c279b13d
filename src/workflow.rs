//! Workflow templates and their resolution into submittable payloads.
//!
//! A template is ComfyUI's API-format job graph: a map from node id to
//! [`NodeDef`], where an input is either a literal or a link
//! `[source_node_id, output_slot]`. [`Resolver::resolve`] validates the graph,
//! finds the nodes playing each semantic [`Role`] and writes the caller's
//! [`Overrides`] into a copy, producing a [`ResolvedJobPayload`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ComfyError, Result};
use crate::seed::{SeedPolicy, RANDOM_SEED};

/// Node classes whose results are final image artifacts.
pub const OUTPUT_NODE_TYPES: &[&str] = &[
    "SaveImage",
    "PreviewImage",
    "SaveAnimatedWEBP",
    "SaveAnimatedPNG",
    "Image Save",
];

/// Name of the template written by [`crate::TemplateStore::ensure_default`].
pub const DEFAULT_TEMPLATE_NAME: &str = "default_save";

/// Words that mark a text-encode node as the negative prompt.
const NEGATIVE_TERMS: &[&str] = &[
    "low quality",
    "bad",
    "worst",
    "ugly",
    "error",
    "distortion",
    "blur",
    "noise",
    "distorted",
    "deformed",
];

/// One node of a job graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub class_type: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Fields this crate does not interpret, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeDef {
    pub fn new(class_type: impl Into<String>, inputs: Value) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: match inputs {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            meta: None,
            extra: Map::new(),
        }
    }

    /// Display title from `_meta.title`.
    pub fn title(&self) -> Option<&str> {
        self.meta.as_ref()?.get("title")?.as_str()
    }

    /// Explicit role tag from `_meta.role`.
    pub fn role_tag(&self) -> Option<Role> {
        self.meta.as_ref()?.get("role")?.as_str()?.parse().ok()
    }

    /// Source node and slot if `input` is a link.
    pub fn link(&self, input: &str) -> Option<(&str, u64)> {
        as_link(self.inputs.get(input)?)
    }

    pub fn is_output(&self) -> bool {
        OUTPUT_NODE_TYPES.contains(&self.class_type.as_str())
            || self.role_tag() == Some(Role::Output)
    }

    fn is_sampler(&self) -> bool {
        self.link("positive").is_some() && self.link("negative").is_some()
    }

    fn text(&self) -> Option<&str> {
        self.inputs.get("text").and_then(|v| v.as_str())
    }

    fn to_value(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("class_type".into(), Value::String(self.class_type.clone()));
        obj.insert("inputs".into(), Value::Object(self.inputs.clone()));
        if let Some(meta) = &self.meta {
            obj.insert("_meta".into(), meta.clone());
        }
        Value::Object(obj)
    }
}

fn as_link(value: &Value) -> Option<(&str, u64)> {
    match value.as_array()?.as_slice() {
        [Value::String(node), slot] => Some((node.as_str(), slot.as_u64()?)),
        _ => None,
    }
}

fn nodes_to_value(nodes: &IndexMap<String, NodeDef>) -> Value {
    Value::Object(
        nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.to_value()))
            .collect(),
    )
}

/// An edge of the job graph: `to.input` consumes `from[slot]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: String,
    pub slot: u64,
    pub to: String,
    pub input: String,
}

/// A named, reusable job graph.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowTemplate {
    name: String,
    nodes: IndexMap<String, NodeDef>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, nodes: IndexMap<String, NodeDef>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Parse a template document, keeping node order as written.
    ///
    /// Accepts the flat API format and the nested `{"nodes": {...}}` form.
    pub fn from_json_str(name: impl Into<String>, text: &str) -> Result<Self> {
        let name = name.into();
        let doc: IndexMap<String, Value> = serde_json::from_str(text).map_err(|e| {
            ComfyError::Template(format!("template '{}' is not a JSON object: {}", name, e))
        })?;
        Self::from_document(name, doc)
    }

    /// Build a template from an already parsed JSON value.
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self> {
        let name = name.into();
        let doc: IndexMap<String, Value> = serde_json::from_value(value).map_err(|e| {
            ComfyError::Template(format!("template '{}' is not a JSON object: {}", name, e))
        })?;
        Self::from_document(name, doc)
    }

    fn from_document(name: String, mut doc: IndexMap<String, Value>) -> Result<Self> {
        if doc.contains_key("last_node_id") {
            return Err(ui_export_error(&name));
        }
        let graph = match doc.shift_remove("nodes") {
            Some(Value::Array(_)) => return Err(ui_export_error(&name)),
            Some(nested @ Value::Object(_)) => serde_json::from_value(nested)?,
            Some(_) => {
                return Err(ComfyError::Template(format!(
                    "template '{}' has a malformed 'nodes' field",
                    name
                )))
            }
            None => doc,
        };

        let mut nodes = IndexMap::with_capacity(graph.len());
        for (id, raw) in graph {
            let node: NodeDef = serde_json::from_value(raw).map_err(|e| {
                ComfyError::Template(format!("template '{}' node {}: {}", name, id, e))
            })?;
            nodes.insert(id, node);
        }
        Ok(Self { name, nodes })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &IndexMap<String, NodeDef> {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.get(id)
    }

    /// Every link in the graph, in node order.
    pub fn links(&self) -> Vec<Link> {
        self.nodes
            .iter()
            .flat_map(|(to, node)| {
                node.inputs.iter().filter_map(move |(input, value)| {
                    as_link(value).map(|(from, slot)| Link {
                        from: from.to_string(),
                        slot,
                        to: to.clone(),
                        input: input.clone(),
                    })
                })
            })
            .collect()
    }

    /// Ids of nodes that produce final artifacts.
    pub fn output_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_output())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Check the structural invariants: at least one node, no dangling
    /// links, at least one output node.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ComfyError::Template(format!(
                "template '{}' has no nodes",
                self.name
            )));
        }
        for link in self.links() {
            if !self.nodes.contains_key(&link.from) {
                return Err(ComfyError::Template(format!(
                    "template '{}': node {} input '{}' links to missing node {}",
                    self.name, link.to, link.input, link.from
                )));
            }
        }
        if self.output_nodes().is_empty() {
            return Err(ComfyError::Template(format!(
                "template '{}' has no output node (expected one of {})",
                self.name,
                OUTPUT_NODE_TYPES.join(", ")
            )));
        }
        Ok(())
    }

    /// The flat API-format graph.
    pub fn to_value(&self) -> Value {
        nodes_to_value(&self.nodes)
    }
}

fn ui_export_error(name: &str) -> ComfyError {
    ComfyError::Template(format!(
        "template '{}' is a UI workflow export; re-export it with \"Save (API Format)\"",
        name
    ))
}

// ── Roles ───────────────────────────────────────────────────────────

/// Semantic role a template field plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Positive,
    Negative,
    Seed,
    Width,
    Height,
    BatchSize,
    Steps,
    Cfg,
    SamplerName,
    Scheduler,
    Denoise,
    Checkpoint,
    FilenamePrefix,
    /// Marks a node as a final output; carries no field.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Integer,
    Number,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Positive => "positive",
            Role::Negative => "negative",
            Role::Seed => "seed",
            Role::Width => "width",
            Role::Height => "height",
            Role::BatchSize => "batch_size",
            Role::Steps => "steps",
            Role::Cfg => "cfg",
            Role::SamplerName => "sampler_name",
            Role::Scheduler => "scheduler",
            Role::Denoise => "denoise",
            Role::Checkpoint => "checkpoint",
            Role::FilenamePrefix => "filename_prefix",
            Role::Output => "output",
        }
    }

    fn input_keys(self) -> &'static [&'static str] {
        match self {
            Role::Positive | Role::Negative => &["text", "text_g", "text_l"],
            Role::Seed => &["seed", "noise_seed"],
            Role::Width => &["width"],
            Role::Height => &["height"],
            Role::BatchSize => &["batch_size"],
            Role::Steps => &["steps"],
            Role::Cfg => &["cfg"],
            Role::SamplerName => &["sampler_name"],
            Role::Scheduler => &["scheduler"],
            Role::Denoise => &["denoise"],
            Role::Checkpoint => &["ckpt_name"],
            Role::FilenamePrefix => &["filename_prefix"],
            Role::Output => &[],
        }
    }

    fn kind(self) -> FieldKind {
        match self {
            Role::Positive
            | Role::Negative
            | Role::SamplerName
            | Role::Scheduler
            | Role::Checkpoint
            | Role::FilenamePrefix
            | Role::Output => FieldKind::Text,
            Role::Seed | Role::Width | Role::Height | Role::BatchSize | Role::Steps => {
                FieldKind::Integer
            }
            Role::Cfg | Role::Denoise => FieldKind::Number,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ComfyError;

    fn from_str(s: &str) -> Result<Self> {
        let role = match s.trim().to_ascii_lowercase().as_str() {
            "positive" | "prompt" | "positive_prompt" => Role::Positive,
            "negative" | "negative_prompt" => Role::Negative,
            "seed" => Role::Seed,
            "width" => Role::Width,
            "height" => Role::Height,
            "batch_size" => Role::BatchSize,
            "steps" => Role::Steps,
            "cfg" => Role::Cfg,
            "sampler" | "sampler_name" => Role::SamplerName,
            "scheduler" => Role::Scheduler,
            "denoise" => Role::Denoise,
            "checkpoint" | "ckpt_name" => Role::Checkpoint,
            "filename_prefix" => Role::FilenamePrefix,
            "output" => Role::Output,
            other => return Err(ComfyError::Template(format!("unknown role '{}'", other))),
        };
        Ok(role)
    }
}

/// A concrete field playing a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleBinding {
    pub node_id: String,
    pub input: String,
}

fn bindings_on(node_id: &str, node: &NodeDef, role: Role) -> Vec<RoleBinding> {
    role.input_keys()
        .iter()
        .filter(|key| node.inputs.contains_key(**key))
        .map(|key| RoleBinding {
            node_id: node_id.to_string(),
            input: key.to_string(),
        })
        .collect()
}

/// Which fields of a template play which role.
#[derive(Debug, Clone, Default)]
pub struct RoleMap {
    bindings: HashMap<Role, Vec<RoleBinding>>,
}

impl RoleMap {
    pub fn get(&self, role: Role) -> &[RoleBinding] {
        self.bindings.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has(&self, role: Role) -> bool {
        !self.get(role).is_empty()
    }

    /// Node ids bound to `role`, deduplicated in binding order.
    pub fn nodes(&self, role: Role) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.get(role)
            .iter()
            .map(|b| b.node_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn fill(&mut self, role: Role, bindings: Vec<RoleBinding>) {
        if !bindings.is_empty() && !self.has(role) {
            self.bindings.insert(role, bindings);
        }
    }

    fn set(&mut self, role: Role, bindings: Vec<RoleBinding>) {
        self.bindings.insert(role, bindings);
    }
}

/// Locate the fields of `template` playing each role.
///
/// `_meta.role` tags win, then the primary sampler's wiring, then text-node
/// heuristics for the prompts.
pub fn detect_roles(template: &WorkflowTemplate) -> RoleMap {
    let mut map = RoleMap::default();

    let mut tagged: HashMap<Role, Vec<RoleBinding>> = HashMap::new();
    for (id, node) in template.nodes() {
        if let Some(role) = node.role_tag() {
            tagged
                .entry(role)
                .or_default()
                .extend(bindings_on(id, node, role));
        }
    }
    for (role, bindings) in tagged {
        map.fill(role, bindings);
    }

    let samplers: Vec<(&String, &NodeDef)> = template
        .nodes()
        .iter()
        .filter(|(_, node)| node.is_sampler())
        .collect();

    let seeds = samplers
        .iter()
        .flat_map(|(id, node)| bindings_on(id, node, Role::Seed))
        .collect();
    map.fill(Role::Seed, seeds);

    if let Some((sampler_id, sampler)) = samplers.first() {
        for role in [
            Role::Steps,
            Role::Cfg,
            Role::SamplerName,
            Role::Scheduler,
            Role::Denoise,
        ] {
            map.fill(role, bindings_on(sampler_id, sampler, role));
        }
        for (role, input) in [(Role::Positive, "positive"), (Role::Negative, "negative")] {
            if let Some((src, _)) = sampler.link(input) {
                if let Some(node) = template.node(src) {
                    map.fill(role, bindings_on(src, node, role));
                }
            }
        }
        if let Some((src, _)) = sampler.link("latent_image") {
            if let Some(node) = template.node(src) {
                for role in [Role::Width, Role::Height, Role::BatchSize] {
                    map.fill(role, bindings_on(src, node, role));
                }
            }
        }
    }

    if !map.has(Role::Width) {
        let latent = template
            .nodes()
            .iter()
            .find(|(_, n)| n.inputs.contains_key("width") && n.inputs.contains_key("height"));
        if let Some((id, node)) = latent {
            for role in [Role::Width, Role::Height, Role::BatchSize] {
                map.fill(role, bindings_on(id, node, role));
            }
        }
    }

    if let Some((id, node)) = template
        .nodes()
        .iter()
        .find(|(_, n)| n.inputs.contains_key("ckpt_name"))
    {
        map.fill(Role::Checkpoint, bindings_on(id, node, Role::Checkpoint));
    }

    let prefixes = template
        .nodes()
        .iter()
        .filter(|(_, n)| n.is_output())
        .flat_map(|(id, n)| bindings_on(id, n, Role::FilenamePrefix))
        .collect();
    map.fill(Role::FilenamePrefix, prefixes);

    if !map.has(Role::Positive) || !map.has(Role::Negative) {
        detect_prompts_by_content(template, &mut map);
    }

    map
}

fn looks_negative(node: &NodeDef) -> bool {
    let title = node.title().unwrap_or("").to_lowercase();
    if title.contains("neg") {
        return true;
    }
    let text = node.text().unwrap_or("").to_lowercase();
    NEGATIVE_TERMS.iter().any(|term| text.contains(term))
}

fn detect_prompts_by_content(template: &WorkflowTemplate, map: &mut RoleMap) {
    let bound: HashSet<String> = map
        .nodes(Role::Positive)
        .into_iter()
        .chain(map.nodes(Role::Negative))
        .map(String::from)
        .collect();

    let candidates: Vec<(&String, &NodeDef)> = template
        .nodes()
        .iter()
        .filter(|(id, n)| {
            n.class_type.contains("CLIPTextEncode") && n.text().is_some() && !bound.contains(*id)
        })
        .collect();

    match candidates.as_slice() {
        [] => {}
        [(id, node)] => {
            let role = if map.has(Role::Positive) {
                Role::Negative
            } else {
                Role::Positive
            };
            tracing::debug!(node = %id, %role, "Single text node assigned by elimination");
            map.fill(role, bindings_on(id, node, role));
        }
        [first, second] => {
            let (negative, positive) = match (looks_negative(first.1), looks_negative(second.1)) {
                (false, true) => (second, first),
                (true, false) | (true, true) => (first, second),
                (false, false) => (second, first),
            };
            tracing::debug!(
                positive = %positive.0,
                negative = %negative.0,
                "Prompt nodes detected by content",
            );
            map.fill(Role::Positive, bindings_on(positive.0, positive.1, Role::Positive));
            map.fill(Role::Negative, bindings_on(negative.0, negative.1, Role::Negative));
        }
        [(id, node), ..] => {
            tracing::warn!(
                count = candidates.len(),
                "Cannot tell prompt nodes apart; using node {} as positive",
                id,
            );
            map.fill(Role::Positive, bindings_on(id, node, Role::Positive));
        }
    }
}

// ── Overrides & resolution ──────────────────────────────────────────

/// Sparse parameter overrides applied during resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    pub positive: Option<String>,
    pub negative: Option<String>,
    /// Requested seed; [`RANDOM_SEED`] asks for a fresh one.
    pub seed: Option<i64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub batch_size: Option<u32>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub denoise: Option<f64>,
    pub checkpoint: Option<String>,
    pub filename_prefix: Option<String>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positive(mut self, text: impl Into<String>) -> Self {
        self.positive = Some(text.into());
        self
    }

    pub fn negative(mut self, text: impl Into<String>) -> Self {
        self.negative = Some(text.into());
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn cfg(mut self, cfg: f64) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler_name = Some(sampler.into());
        self
    }

    pub fn scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = Some(scheduler.into());
        self
    }

    pub fn denoise(mut self, denoise: f64) -> Self {
        self.denoise = Some(denoise);
        self
    }

    pub fn checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    pub fn filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = Some(prefix.into());
        self
    }

    /// Every set override except the seed, as role/value pairs.
    fn entries(&self) -> Vec<(Role, Value)> {
        let mut out = Vec::new();
        let mut push = |role: Role, value: Option<Value>| {
            if let Some(v) = value {
                out.push((role, v));
            }
        };
        push(Role::Positive, self.positive.clone().map(Value::String));
        push(Role::Negative, self.negative.clone().map(Value::String));
        push(Role::Width, self.width.map(|v| json!(v)));
        push(Role::Height, self.height.map(|v| json!(v)));
        push(Role::BatchSize, self.batch_size.map(|v| json!(v)));
        push(Role::Steps, self.steps.map(|v| json!(v)));
        push(Role::Cfg, self.cfg.map(|v| json!(v)));
        push(Role::SamplerName, self.sampler_name.clone().map(Value::String));
        push(Role::Scheduler, self.scheduler.clone().map(Value::String));
        push(Role::Denoise, self.denoise.map(|v| json!(v)));
        push(Role::Checkpoint, self.checkpoint.clone().map(Value::String));
        push(Role::FilenamePrefix, self.filename_prefix.clone().map(Value::String));
        out
    }
}

/// A template with overrides applied, ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJobPayload {
    template: String,
    nodes: IndexMap<String, NodeDef>,
    seed: Option<u64>,
    output_nodes: Vec<String>,
    unmatched: Vec<Role>,
}

impl ResolvedJobPayload {
    pub fn template_name(&self) -> &str {
        &self.template
    }

    pub fn nodes(&self) -> &IndexMap<String, NodeDef> {
        &self.nodes
    }

    /// Value of one node input, if present.
    pub fn input(&self, node_id: &str, input: &str) -> Option<&Value> {
        self.nodes.get(node_id)?.inputs.get(input)
    }

    /// The concrete seed sent with this payload.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn output_nodes(&self) -> &[String] {
        &self.output_nodes
    }

    /// Override roles that found no field in the template.
    pub fn unmatched(&self) -> &[Role] {
        &self.unmatched
    }

    /// The flat graph in ComfyUI's `/prompt` format.
    pub fn to_prompt(&self) -> Value {
        nodes_to_value(&self.nodes)
    }
}

/// Applies [`Overrides`] to templates.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    seed_policy: SeedPolicy,
    pins: Vec<(Role, String)>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed_policy(mut self, policy: SeedPolicy) -> Self {
        self.seed_policy = policy;
        self
    }

    /// Force `role` onto a specific node, bypassing detection.
    pub fn bind(mut self, role: Role, node_id: impl Into<String>) -> Self {
        self.pins.push((role, node_id.into()));
        self
    }

    /// Produce a submittable payload from `template` and `overrides`.
    pub fn resolve(
        &self,
        template: &WorkflowTemplate,
        overrides: &Overrides,
    ) -> Result<ResolvedJobPayload> {
        template.validate()?;

        let mut roles = detect_roles(template);
        for (role, node_id) in &self.pins {
            let node = template.node(node_id).ok_or_else(|| {
                ComfyError::Template(format!(
                    "node {} bound to role {} does not exist in '{}'",
                    node_id,
                    role,
                    template.name()
                ))
            })?;
            let bindings = bindings_on(node_id, node, *role);
            if bindings.is_empty() {
                return Err(ComfyError::Template(format!(
                    "node {} ({}) has no field for role {}",
                    node_id, node.class_type, role
                )));
            }
            roles.set(*role, bindings);
        }

        let mut nodes = template.nodes().clone();
        let mut unmatched = Vec::new();

        for (role, value) in overrides.entries() {
            if !apply_role(&mut nodes, &roles, role, &value)? {
                tracing::warn!(
                    template = %template.name(),
                    %role,
                    "No field matches override; ignoring it",
                );
                unmatched.push(role);
            }
        }

        let mut fresh_seed = None;
        if let Some(requested) = overrides.seed {
            let seed = self.seed_policy.resolve_seed(requested);
            if apply_role(&mut nodes, &roles, Role::Seed, &json!(seed))? {
                fresh_seed = Some(seed);
            } else {
                tracing::warn!(template = %template.name(), "Template has no seed field; ignoring seed");
                unmatched.push(Role::Seed);
            }
        }

        // Template-held sentinels never reach the server.
        for binding in roles.get(Role::Seed) {
            let Some(value) = nodes
                .get_mut(&binding.node_id)
                .and_then(|n| n.inputs.get_mut(&binding.input))
            else {
                continue;
            };
            if value.as_i64().is_some_and(|v| v < 0) {
                let seed =
                    *fresh_seed.get_or_insert_with(|| self.seed_policy.resolve_seed(RANDOM_SEED));
                *value = json!(seed);
            }
        }

        let seed = fresh_seed.or_else(|| {
            roles.get(Role::Seed).iter().find_map(|b| {
                nodes
                    .get(&b.node_id)
                    .and_then(|n| n.inputs.get(&b.input))
                    .and_then(Value::as_u64)
            })
        });

        Ok(ResolvedJobPayload {
            template: template.name().to_string(),
            output_nodes: template.output_nodes(),
            nodes,
            seed,
            unmatched,
        })
    }
}

/// Resolve with the default (random) seed policy and no pinned nodes.
pub fn resolve(template: &WorkflowTemplate, overrides: &Overrides) -> Result<ResolvedJobPayload> {
    Resolver::new().resolve(template, overrides)
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "text",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Write `value` into every literal field bound to `role`.
/// Returns whether any field was written.
fn apply_role(
    nodes: &mut IndexMap<String, NodeDef>,
    roles: &RoleMap,
    role: Role,
    value: &Value,
) -> Result<bool> {
    let mut applied = false;
    for binding in roles.get(role) {
        let Some(node) = nodes.get_mut(&binding.node_id) else {
            continue;
        };
        let Some(current) = node.inputs.get_mut(&binding.input) else {
            continue;
        };
        if as_link(current).is_some() {
            tracing::warn!(
                node = %binding.node_id,
                input = %binding.input,
                %role,
                "Field is driven by another node; leaving it",
            );
            continue;
        }
        let fits = match role.kind() {
            FieldKind::Text => current.is_string(),
            FieldKind::Integer | FieldKind::Number => current.is_number(),
        };
        if !fits {
            return Err(ComfyError::Template(format!(
                "cannot set {} on node {} input '{}': the field holds {}, the override is {}",
                role,
                binding.node_id,
                binding.input,
                describe(current),
                describe(value)
            )));
        }
        *current = value.clone();
        applied = true;
    }
    Ok(applied)
}

// ── Text-to-image builder ───────────────────────────────────────────

/// The standard 7-node txt2img graph: CheckpointLoader → CLIP encoders
/// → KSampler → VAEDecode → SaveImage. The seed is left as the random
/// sentinel so resolution always picks a concrete one.
pub fn basic_template(name: impl Into<String>, checkpoint: &str) -> WorkflowTemplate {
    let graph = json!({
        "1": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": {
                "ckpt_name": checkpoint
            }
        },
        "2": {
            "class_type": "EmptyLatentImage",
            "inputs": {
                "width": 512,
                "height": 768,
                "batch_size": 1
            }
        },
        "3": {
            "class_type": "CLIPTextEncode",
            "inputs": {
                "text": "high quality, fine details, realistic, high definition photography",
                "clip": ["1", 1]
            }
        },
        "4": {
            "class_type": "CLIPTextEncode",
            "inputs": {
                "text": "low quality, blurry, distorted, error, noise",
                "clip": ["1", 1]
            }
        },
        "5": {
            "class_type": "KSampler",
            "inputs": {
                "seed": RANDOM_SEED,
                "steps": 25,
                "cfg": 7.5,
                "sampler_name": "dpmpp_2m",
                "scheduler": "karras",
                "denoise": 1.0,
                "model": ["1", 0],
                "positive": ["3", 0],
                "negative": ["4", 0],
                "latent_image": ["2", 0]
            }
        },
        "6": {
            "class_type": "VAEDecode",
            "inputs": {
                "samples": ["5", 0],
                "vae": ["1", 2]
            }
        },
        "7": {
            "class_type": "SaveImage",
            "inputs": {
                "filename_prefix": "ComfyUI",
                "images": ["6", 0]
            }
        }
    });

    let nodes = match graph {
        Value::Object(map) => map
            .into_iter()
            .filter_map(|(id, raw)| serde_json::from_value(raw).ok().map(|n| (id, n)))
            .collect(),
        _ => IndexMap::new(),
    };
    WorkflowTemplate::new(name, nodes)
}

/// Builder for a txt2img ComfyUI workflow.
///
/// # Example
/// ```
/// use comfy_remote::Txt2ImgRequest;
///
/// let payload = Txt2ImgRequest::new("a cat in space", "dreamshaper_8.safetensors")
///     .negative("lowres, blurry")
///     .size(512, 768)
///     .steps(25)
///     .cfg_scale(7.5)
///     .build()
///     .unwrap();
///
/// assert!(payload.seed().is_some());
/// assert!(payload.input("1", "ckpt_name").is_some()); // CheckpointLoader node
/// ```
#[derive(Debug, Clone)]
pub struct Txt2ImgRequest {
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub checkpoint: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub seed: i64,
    pub batch_size: u32,
    pub filename_prefix: String,
}

impl Txt2ImgRequest {
    /// Create a new request with a prompt and checkpoint. Uses sensible defaults
    /// for all other parameters (512x768, 25 steps, cfg 7.5, dpmpp_2m/karras).
    pub fn new(prompt: impl Into<String>, checkpoint: impl Into<String>) -> Self {
        Self {
            positive_prompt: prompt.into(),
            negative_prompt: String::new(),
            checkpoint: checkpoint.into(),
            width: 512,
            height: 768,
            steps: 25,
            cfg_scale: 7.5,
            sampler: "dpmpp_2m".to_string(),
            scheduler: "karras".to_string(),
            seed: RANDOM_SEED,
            batch_size: 1,
            filename_prefix: "ComfyUI".to_string(),
        }
    }

    /// Set the negative prompt.
    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = prompt.into();
        self
    }

    /// Set output dimensions.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of sampling steps.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Set the classifier-free guidance scale.
    pub fn cfg_scale(mut self, cfg: f64) -> Self {
        self.cfg_scale = cfg;
        self
    }

    /// Set the sampler algorithm (e.g. "euler", "dpmpp_2m", "dpmpp_sde").
    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self
    }

    /// Set the noise scheduler (e.g. "normal", "karras", "exponential").
    pub fn scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = scheduler.into();
        self
    }

    /// Set a specific seed. Use -1 (the default) for random.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the batch size (number of images per generation).
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the output filename prefix in ComfyUI.
    pub fn filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = prefix.into();
        self
    }

    /// The template this request resolves against.
    pub fn template(&self) -> WorkflowTemplate {
        basic_template("txt2img", &self.checkpoint)
    }

    /// The request's parameters as overrides.
    pub fn overrides(&self) -> Overrides {
        Overrides::new()
            .positive(&self.positive_prompt)
            .negative(&self.negative_prompt)
            .size(self.width, self.height)
            .batch_size(self.batch_size)
            .steps(self.steps)
            .cfg(self.cfg_scale)
            .sampler(&self.sampler)
            .scheduler(&self.scheduler)
            .seed(self.seed)
            .filename_prefix(&self.filename_prefix)
    }

    /// Resolve into a payload with a random seed source.
    pub fn build(&self) -> Result<ResolvedJobPayload> {
        self.build_with(&Resolver::new())
    }

    pub fn build_with(&self, resolver: &Resolver) -> Result<ResolvedJobPayload> {
        resolver.resolve(&self.template(), &self.overrides())
    }
}
