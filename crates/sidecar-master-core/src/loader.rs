//! Configuration XML loader.
//!
//! A configuration file describes one deployment: the radar it serves, where
//! runners log and record, and the runners themselves with their streams.
//!
//! ```xml
//! <sidecar>
//!   <radar file="radar.xml"/>
//!   <dp logsDirectory="/var/log/sidecar" recordingsDirectory="/space1/recordings" state="Run">
//!     <runner name="ingest" host="node1">
//!       <stream name="video">...</stream>
//!     </runner>
//!   </dp>
//! </sidecar>
//! ```
//!
//! `<radar>`, `<runner>` and `<stream>` may each point at an include file with
//! a `file` attribute (relative to the configuration's directory). Attributes
//! on the referencing element override those in the included one.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::processing_state::ProcessingState;
use crate::status::RunnerId;

pub const DEFAULT_LOGS_DIRECTORY: &str = "/tmp";
pub const DEFAULT_RECORDINGS_DIRECTORY: &str = "/space1/recordings";
pub const DEFAULT_INITIAL_STATE: ProcessingState = ProcessingState::Run;

const ATTR_FILE: &str = "file";

/// Why a configuration failed to load. The `Display` text is shown to the
/// operator as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to open configuration file {}: {reason}", path.display())]
    FileOpen { path: PathBuf, reason: String },

    #[error(
        "Invalid XML located at position {column} of line {line} of file {}",
        path.display()
    )]
    XmlParse {
        path: PathBuf,
        line: u32,
        column: u32,
    },

    #[error("Missing <{entity}> entity node in file {}", path.display())]
    MissingEntity { path: PathBuf, entity: String },

    #[error("Missing <sidecar> element")]
    MissingSidecar,

    #[error("Missing <radar> element")]
    MissingRadar,

    #[error("Invalid <radar> element: {0}")]
    InvalidRadar(String),

    #[error("Missing <dp> element")]
    MissingDp,

    #[error("No <stream> entities defined for runner '{runner}'")]
    MissingStreams { runner: String },

    #[error("No <runner> entities defined")]
    MissingRunners,

    #[error("No configuration file loaded.")]
    NotLoaded,
}

// =============================================================================
// Loaded model
// =============================================================================

/// Radar description shared by every runner of a configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarSettings {
    pub name: String,
    pub gate_count_max: u32,
    pub shaft_encoding_max: u32,
    pub range_min: f64,
    pub range_max: f64,
    pub rotation_rate: f64,
    pub beam_width: f64,
    /// Degrees.
    pub latitude: Option<f64>,
    /// Degrees.
    pub longitude: Option<f64>,
    pub height: Option<f64>,
}

/// A stream definition, kept verbatim for the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: Option<String>,
    pub xml: String,
}

/// One expected runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub id: RunnerId,
    pub opts: String,
    pub multicast_address: String,
    pub scheduler: String,
    pub priority: String,
    pub cpu_affinity: String,
    pub initial_state: ProcessingState,
    pub streams: Vec<StreamConfig>,
    pub log_path: PathBuf,
}

impl RunnerConfig {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.runner
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.id.host
    }

    #[must_use]
    pub fn service_name(&self) -> String {
        self.id.service_name()
    }
}

/// A successfully loaded configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfiguration {
    pub name: String,
    pub path: PathBuf,
    pub radar: RadarSettings,
    pub logs_directory: PathBuf,
    pub recordings_directory: PathBuf,
    pub logger_configuration: Option<PathBuf>,
    pub initial_state: ProcessingState,
    pub runners: Vec<RunnerConfig>,
    /// Unique hosts in runner order.
    pub host_names: Vec<String>,
    pub include_paths: Vec<PathBuf>,
    /// Modification time of the main file when it was read.
    pub modified: Option<SystemTime>,
}

impl LoadedConfiguration {
    #[must_use]
    pub fn expected_runners(&self) -> Vec<RunnerId> {
        self.runners.iter().map(|r| r.id.clone()).collect()
    }

    #[must_use]
    pub fn runner(&self, id: &RunnerId) -> Option<&RunnerConfig> {
        self.runners.iter().find(|r| r.id == *id)
    }
}

/// Configuration name for a file path: the file name up to its first dot.
#[must_use]
pub fn configuration_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.split('.').next().unwrap_or(name).to_string())
        .unwrap_or_default()
}

/// Expand `$VAR`, `${VAR}` and a leading `~`. Unknown variables are left as
/// written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    if let Some(tail) = rest.strip_prefix('~') {
        if tail.is_empty() || tail.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                out.push_str(&home.to_string_lossy());
                rest = tail;
            }
        }
    }

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), std::env::var(name)) {
            (false, Ok(expanded)) => out.push_str(&expanded),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Parsing
// =============================================================================

fn read_file(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|err| LoadError::FileOpen {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn parse_document<'a>(text: &'a str, path: &Path) -> Result<roxmltree::Document<'a>, LoadError> {
    roxmltree::Document::parse(text).map_err(|err| {
        let pos = err.pos();
        LoadError::XmlParse {
            path: path.to_path_buf(),
            line: pos.row,
            column: pos.col,
        }
    })
}

fn child_element<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_elements<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn element_text(node: roxmltree::Node<'_, '_>) -> String {
    node.text().map(str::trim).unwrap_or_default().to_string()
}

struct Includes<'d> {
    dir: &'d Path,
    paths: Vec<PathBuf>,
}

impl Includes<'_> {
    /// Open an include file and hand its `entity` element to `f`.
    fn with_include<T>(
        &mut self,
        file: &str,
        entity: &str,
        f: impl FnOnce(roxmltree::Node<'_, '_>) -> Result<T, LoadError>,
    ) -> Result<T, LoadError> {
        let path = self.dir.join(expand_env_vars(file));
        tracing::debug!(path = %path.display(), entity, "loading include file");
        let text = read_file(&path)?;
        self.paths.push(path.clone());
        let doc = parse_document(&text, &path)?;
        let root = doc.root_element();
        if root.tag_name().name() != entity {
            return Err(LoadError::MissingEntity {
                path,
                entity: entity.to_string(),
            });
        }
        f(root)
    }
}

fn parse_radar(node: roxmltree::Node<'_, '_>) -> Result<RadarSettings, LoadError> {
    let field = |name: &str| {
        child_element(node, name)
            .map(element_text)
            .ok_or_else(|| LoadError::InvalidRadar(format!("missing field <{name}>")))
    };
    let unsigned = |name: &str| field(name).map(|v| v.parse::<u32>().unwrap_or(0));
    let real = |name: &str| field(name).map(|v| v.parse::<f64>().unwrap_or(0.0));
    let angle = |name: &str| {
        child_element(node, name).map(|el| {
            let value = element_text(el).parse::<f64>().unwrap_or(0.0);
            if el.attribute("units") == Some("radians") {
                value.to_degrees()
            } else {
                value
            }
        })
    };

    let name = field("name")?;
    let gate_count_max = unsigned("gateCountMax")?;
    if gate_count_max < 2 {
        return Err(LoadError::InvalidRadar(format!(
            "invalid gateCountMax value {gate_count_max}"
        )));
    }
    let shaft_encoding_max = unsigned("shaftEncodingMax")?;
    if shaft_encoding_max < 2 {
        return Err(LoadError::InvalidRadar(format!(
            "invalid shaftEncodingMax value {shaft_encoding_max}"
        )));
    }
    let range_min = real("rangeMin")?;
    let range_max = real("rangeMax")?;
    if range_min >= range_max || range_min < 0.0 || range_max <= 0.0 {
        return Err(LoadError::InvalidRadar(format!(
            "invalid range specification {range_min},{range_max}"
        )));
    }
    let rotation_rate = real("rotationRate")?;
    if rotation_rate <= 0.0 {
        return Err(LoadError::InvalidRadar(format!(
            "invalid rotationRate value {rotation_rate}"
        )));
    }
    let beam_width = real("beamWidth")?;
    if beam_width <= 0.0 {
        return Err(LoadError::InvalidRadar(format!(
            "invalid beamWidth value {beam_width}"
        )));
    }

    Ok(RadarSettings {
        name,
        gate_count_max,
        shaft_encoding_max,
        range_min,
        range_max,
        rotation_rate,
        beam_width,
        latitude: angle("latitude"),
        longitude: angle("longitude"),
        height: child_element(node, "height").map(|el| element_text(el).parse().unwrap_or(0.0)),
    })
}

fn parse_state(value: Option<&str>, fallback: ProcessingState, context: &str) -> ProcessingState {
    match value {
        None => fallback,
        Some(raw) => match raw.parse::<ProcessingState>() {
            Ok(state) if state != ProcessingState::Invalid => state,
            _ => {
                tracing::warn!(state = raw, context, fallback = %fallback, "unknown processing state");
                fallback
            }
        },
    }
}

/// Runner attributes gathered from the include file and the referencing
/// element, in that order.
#[derive(Default)]
struct RunnerAttrs {
    name: String,
    host: String,
    opts: String,
    multicast: String,
    scheduler: String,
    priority: String,
    cpu: String,
    state: Option<String>,
}

impl RunnerAttrs {
    fn absorb(&mut self, node: roxmltree::Node<'_, '_>) {
        let set = |slot: &mut String, key: &str| {
            if let Some(value) = node.attribute(key) {
                *slot = value.to_string();
            }
        };
        set(&mut self.name, "name");
        set(&mut self.host, "host");
        set(&mut self.opts, "opts");
        set(&mut self.multicast, "multicast");
        set(&mut self.scheduler, "scheduler");
        set(&mut self.priority, "priority");
        set(&mut self.cpu, "cpu");
        if let Some(state) = node.attribute("state") {
            self.state = Some(state.to_string());
        }
    }
}

fn collect_streams(
    runner: roxmltree::Node<'_, '_>,
    includes: &mut Includes<'_>,
) -> Result<Vec<StreamConfig>, LoadError> {
    let mut streams = Vec::new();
    for stream in child_elements(runner, "stream") {
        let config = match stream.attribute(ATTR_FILE) {
            Some(file) => includes.with_include(file, "stream", |node| Ok(stream_config(node)))?,
            None => stream_config(stream),
        };
        streams.push(config);
    }
    Ok(streams)
}

fn stream_config(node: roxmltree::Node<'_, '_>) -> StreamConfig {
    StreamConfig {
        name: node.attribute("name").map(str::to_string),
        xml: node.document().input_text()[node.range()].to_string(),
    }
}

/// Load and validate one configuration file.
pub fn load_configuration(path: &Path) -> Result<LoadedConfiguration, LoadError> {
    let name = configuration_name(path);
    let text = read_file(path)?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let doc = parse_document(&text, path)?;

    let sidecar = Some(doc.root_element())
        .filter(|n| n.tag_name().name() == "sidecar")
        .ok_or(LoadError::MissingSidecar)?;
    let radar = child_element(sidecar, "radar").ok_or(LoadError::MissingRadar)?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut includes = Includes {
        dir,
        paths: Vec::new(),
    };

    let radar = match radar.attribute(ATTR_FILE) {
        Some(file) => includes.with_include(file, "radar", parse_radar)?,
        None => parse_radar(radar)?,
    };

    let dp = child_element(sidecar, "dp").ok_or(LoadError::MissingDp)?;

    let logger_configuration = match (dp.attribute("loggerConfigPath"), dp.attribute("loggerConfiguration")) {
        (Some(old), _) => {
            tracing::warn!(configuration = %name, "using deprecated 'loggerConfigPath' attribute");
            Some(old)
        }
        (None, current) => current,
    }
    .filter(|v| !v.is_empty())
    .map(|v| PathBuf::from(expand_env_vars(v)));

    let logs_directory = match dp.attribute("logsDirectory") {
        Some(dir) if !dir.is_empty() => dir.to_string(),
        Some(_) => {
            tracing::warn!(configuration = %name, "empty logsDirectory, using {DEFAULT_LOGS_DIRECTORY}");
            DEFAULT_LOGS_DIRECTORY.to_string()
        }
        None => DEFAULT_LOGS_DIRECTORY.to_string(),
    };
    let logs_directory = PathBuf::from(expand_env_vars(&logs_directory));

    let recordings_directory = match dp.attribute("recordingBasePath") {
        Some(old) => {
            tracing::warn!(configuration = %name, "using deprecated 'recordingBasePath' attribute");
            old
        }
        None => dp
            .attribute("recordingsDirectory")
            .unwrap_or(DEFAULT_RECORDINGS_DIRECTORY),
    };
    let recordings_directory = PathBuf::from(expand_env_vars(recordings_directory));

    let initial_state = parse_state(dp.attribute("state"), DEFAULT_INITIAL_STATE, "dp");

    let mut runners: Vec<RunnerConfig> = Vec::new();
    let mut host_names: Vec<String> = Vec::new();
    for runner in child_elements(dp, "runner") {
        let mut attrs = RunnerAttrs::default();
        let streams = match runner.attribute(ATTR_FILE) {
            Some(file) => {
                let mut nested = Includes {
                    dir,
                    paths: Vec::new(),
                };
                let streams = includes.with_include(file, "runner", |node| {
                    attrs.absorb(node);
                    collect_streams(node, &mut nested)
                })?;
                includes.paths.append(&mut nested.paths);
                streams
            }
            None => collect_streams(runner, &mut includes)?,
        };
        attrs.absorb(runner);
        if attrs.name.is_empty() {
            attrs.name = format!("Runner {}", runners.len() + 1);
        }
        if streams.is_empty() {
            return Err(LoadError::MissingStreams { runner: attrs.name });
        }
        if !host_names.contains(&attrs.host) {
            host_names.push(attrs.host.clone());
        }

        let log_path =
            logs_directory.join(format!("{name}_{}.log", attrs.name.replace('/', "_")));
        runners.push(RunnerConfig {
            id: RunnerId::new(name.clone(), attrs.host, attrs.name),
            opts: attrs.opts,
            multicast_address: attrs.multicast,
            scheduler: attrs.scheduler,
            priority: attrs.priority,
            cpu_affinity: attrs.cpu,
            initial_state: parse_state(attrs.state.as_deref(), initial_state, "runner"),
            streams,
            log_path,
        });
    }

    if runners.is_empty() {
        return Err(LoadError::MissingRunners);
    }

    tracing::info!(
        configuration = %name,
        runners = runners.len(),
        hosts = host_names.len(),
        "configuration loaded"
    );

    Ok(LoadedConfiguration {
        name,
        path: path.to_path_buf(),
        radar,
        logs_directory,
        recordings_directory,
        logger_configuration,
        initial_state,
        runners,
        host_names,
        include_paths: includes.paths,
        modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RADAR: &str = r#"<radar>
        <name>Test</name>
        <gateCountMax>4000</gateCountMax>
        <shaftEncodingMax>65535</shaftEncodingMax>
        <rotationRate units="rpm">6</rotationRate>
        <rangeMin>0</rangeMin>
        <rangeMax>300</rangeMax>
        <beamWidth>0.001</beamWidth>
        <latitude units="radians">1</latitude>
    </radar>"#;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).expect("write fixture");
        path
    }

    fn config_xml(radar: &str, dp_body: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<sidecar>
  {radar}
  <dp recordingsDirectory="/data/rec" state="Calibrate">
    {dp_body}
  </dp>
</sidecar>"#
        )
    }

    #[test]
    fn loads_runners_and_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let body = r#"
            <runner name="ingest" host="node1"><stream name="video"><task/></stream></runner>
            <runner host="node2" state="Run"><stream/></runner>
            <runner name="a/b" host="node1"><stream/></runner>"#;
        let path = write(dir.path(), "alpha.test.xml", &config_xml(RADAR, body));

        let loaded = load_configuration(&path).unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.logs_directory, PathBuf::from("/tmp"));
        assert_eq!(loaded.recordings_directory, PathBuf::from("/data/rec"));
        assert_eq!(loaded.initial_state, ProcessingState::Calibrate);
        assert_eq!(loaded.host_names, vec!["node1", "node2"]);
        assert_eq!(loaded.runners.len(), 3);

        let first = &loaded.runners[0];
        assert_eq!(first.service_name(), "alpha:node1:ingest");
        assert_eq!(first.initial_state, ProcessingState::Calibrate);
        assert_eq!(first.streams[0].name.as_deref(), Some("video"));
        assert!(first.streams[0].xml.starts_with("<stream"));
        assert_eq!(first.log_path, PathBuf::from("/tmp/alpha_ingest.log"));

        assert_eq!(loaded.runners[1].name(), "Runner 2");
        assert_eq!(loaded.runners[1].initial_state, ProcessingState::Run);
        assert_eq!(
            loaded.runners[2].log_path,
            PathBuf::from("/tmp/alpha_a_b.log")
        );

        let lat = loaded.radar.latitude.unwrap();
        assert!((lat - 1.0_f64.to_degrees()).abs() < 1e-9);
    }

    #[test]
    fn missing_file_is_file_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_configuration(&dir.path().join("nope.xml")).unwrap_err();
        assert!(matches!(err, LoadError::FileOpen { .. }));
    }

    #[test]
    fn bad_xml_reports_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "bad.xml", "<sidecar>\n  <radar>\n</sidecar>");
        match load_configuration(&path).unwrap_err() {
            LoadError::XmlParse { line, .. } => assert_eq!(line, 3),
            other => panic!("expected XmlParse, got {other}"),
        }
    }

    #[test]
    fn structural_errors_are_distinct() {
        let dir = tempfile::tempdir().expect("tempdir");
        let no_dp = format!("<sidecar>{RADAR}</sidecar>");
        let no_runners = config_xml(RADAR, "");
        let no_streams = config_xml(RADAR, r#"<runner name="r" host="h"/>"#);
        let cases: [(&str, LoadError); 5] = [
            ("<other/>", LoadError::MissingSidecar),
            ("<sidecar><dp/></sidecar>", LoadError::MissingRadar),
            (&no_dp, LoadError::MissingDp),
            (&no_runners, LoadError::MissingRunners),
            (
                &no_streams,
                LoadError::MissingStreams {
                    runner: "r".to_string(),
                },
            ),
        ];
        for (index, (xml, expected)) in cases.iter().enumerate() {
            let path = write(dir.path(), &format!("case{index}.xml"), xml);
            assert_eq!(&load_configuration(&path).unwrap_err(), expected);
        }
    }

    #[test]
    fn radar_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bad_range = RADAR.replace("<rangeMin>0</rangeMin>", "<rangeMin>400</rangeMin>");
        let no_gates = RADAR.replace("4000", "1");
        for (index, radar) in [bad_range, no_gates].iter().enumerate() {
            let xml = config_xml(radar, r#"<runner host="h"><stream/></runner>"#);
            let path = write(dir.path(), &format!("radar{index}.xml"), &xml);
            assert!(matches!(
                load_configuration(&path),
                Err(LoadError::InvalidRadar(_))
            ));
        }
    }

    #[test]
    fn include_files_are_resolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "radar.xml", RADAR);
        write(
            dir.path(),
            "runner.xml",
            r#"<runner name="included" host="node9" opts="-v"><stream file="stream.xml"/></runner>"#,
        );
        write(dir.path(), "stream.xml", r#"<stream name="from-file"/>"#);
        let xml = config_xml(
            r#"<radar file="radar.xml"/>"#,
            r#"<runner file="runner.xml" host="override"/>"#,
        );
        let path = write(dir.path(), "inc.xml", &xml);

        let loaded = load_configuration(&path).unwrap();
        let runner = &loaded.runners[0];
        assert_eq!(runner.name(), "included");
        assert_eq!(runner.host(), "override");
        assert_eq!(runner.opts, "-v");
        assert_eq!(runner.streams[0].name.as_deref(), Some("from-file"));
        assert_eq!(loaded.radar.name, "Test");
    }

    #[test]
    fn include_with_wrong_entity() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "radar.xml", "<notradar/>");
        let xml = config_xml(r#"<radar file="radar.xml"/>"#, "");
        let path = write(dir.path(), "wrong.xml", &xml);
        assert!(matches!(
            load_configuration(&path),
            Err(LoadError::MissingEntity { ref entity, .. }) if entity == "radar"
        ));
    }

    #[test]
    fn env_expansion() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(expand_env_vars("$HOME/rec"), format!("{home}/rec"));
        assert_eq!(expand_env_vars("${HOME}/rec"), format!("{home}/rec"));
        assert_eq!(
            expand_env_vars("$SCM_SURELY_UNSET_VAR/x"),
            "$SCM_SURELY_UNSET_VAR/x"
        );
        assert_eq!(expand_env_vars("plain"), "plain");
        assert_eq!(expand_env_vars("cost$"), "cost$");
    }
}
