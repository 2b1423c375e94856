//! Profiling configuration.
//!
//! The configuration is an XML document declaring the source regions to
//! profile, how to sample them, and optional sensor selection masks. The
//! loader validates as it goes and reports one specific error code per
//! schema rule, so a bad config names the exact rule it broke.

use std::path::Path;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

pub type CfgResult<T> = Result<T, CfgError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CfgError {
    #[error("I/O error when loading config file")]
    ConfigIoError,
    #[error("Config file not found")]
    ConfigNotFound,
    #[error("Config file is badly formatted")]
    ConfigBadFormat,
    #[error("Node <config></config> not found")]
    ConfigNoConfig,
    #[error("Invalid thread count in <threads></threads>")]
    InvalidThreadCount,
    #[error("Section list <sections></sections> is empty")]
    SecListEmpty,
    #[error("section: Node <bounds></bounds> not found")]
    SecNoBounds,
    #[error("section: Node <freq></freq> not found")]
    SecNoFreq,
    #[error("section: target must be 'cpu' or 'gpu'")]
    SecInvalidTarget,
    #[error("section: name cannot be empty")]
    SecInvalidName,
    #[error("section: extra data cannot be empty")]
    SecInvalidExtra,
    #[error("section: frequency must be a positive decimal number")]
    SecInvalidFreq,
    #[error("section: interval must be a positive integer")]
    SecInvalidInterval,
    #[error("section: method must be 'profile' or 'total'")]
    SecInvalidMethod,
    #[error("section: executions must be a positive integer")]
    SecInvalidExecs,
    #[error("section: samples must be a positive integer")]
    SecInvalidSamples,
    #[error("section: duration must be a positive integer")]
    SecInvalidDuration,
    #[error("params: parameter 'domain_mask' must be a valid integer")]
    ParamInvalidDomainMask,
    #[error("params: parameter 'socket_mask' must be a valid integer")]
    ParamInvalidSocketMask,
    #[error("params: parameter 'device_mask' must be a valid integer")]
    ParamInvalidDeviceMask,
    #[error("bounds: node <start></start> not found")]
    BoundsNoStart,
    #[error("bounds: node <end></end> not found")]
    BoundsNoEnd,
    #[error("bounds: function name cannot be empty")]
    BoundsInvalidFunction,
    #[error("Node <cu></cu> not found")]
    PosNoCompUnit,
    #[error("Node <line></line> not found")]
    PosNoLine,
    #[error("Invalid compilation unit: cannot be empty")]
    PosInvalidCompUnit,
    #[error("Invalid line number: must be a positive integer")]
    PosInvalidLine,
}

/// What the section's sampler reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Cpu,
    Gpu,
}

/// How the section is sampled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProfilingMethod {
    /// Periodic samples over the whole execution.
    #[default]
    EnergyProfile,
    /// Start and end readings only.
    EnergyTotal,
}

/// A source position: compilation unit and line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position {
    pub compilation_unit: String,
    pub line: u32,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.compilation_unit, self.line)
    }
}

/// Region bounds: a start/end position pair, or a whole function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bounds {
    Positions { start: Position, end: Position },
    Function { cu: Option<String>, name: String },
}

/// Sensor selection masks. All bits set by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Params {
    pub domain_mask: u32,
    pub socket_mask: u32,
    pub device_mask: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            domain_mask: !0,
            socket_mask: !0,
            device_mask: !0,
        }
    }
}

/// One profiled source region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: Option<String>,
    pub extra: Option<String>,
    pub target: Target,
    pub method: ProfilingMethod,
    pub bounds: Bounds,
    pub interval: Duration,
    /// 0 means unbounded.
    pub executions: u32,
    /// 0 means no sample bound.
    pub samples: u32,
}

/// One `<sections>` block; becomes one group in the results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub label: Option<String>,
    pub extra: Option<String>,
    pub sections: Vec<Section>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigData {
    pub threads: u32,
    pub parameters: Params,
    pub groups: Vec<Group>,
}

impl ConfigData {
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.groups.iter().flat_map(|g| g.sections.iter())
    }
}

/// Loads and validates a configuration file.
pub fn load_config(path: &Path) -> CfgResult<ConfigData> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CfgError::ConfigNotFound,
        _ => CfgError::ConfigIoError,
    })?;
    parse_config(&text)
}

/// Parses and validates a configuration document.
pub fn parse_config(text: &str) -> CfgResult<ConfigData> {
    let root = parse_tree(text)?;
    if root.name != "config" {
        return Err(CfgError::ConfigNoConfig);
    }

    let mut config = ConfigData::default();

    if let Some(threads) = root.child("threads") {
        config.threads = parse_positive(&threads.text).ok_or(CfgError::InvalidThreadCount)?;
    }

    if let Some(params) = root.child("params") {
        config.parameters = get_params(params)?;
    }

    for block in root.children.iter().filter(|c| c.name == "sections") {
        let mut group = Group {
            label: non_empty(block.attr("label")),
            extra: non_empty(block.attr("extra")),
            sections: Vec::new(),
        };
        for node in &block.children {
            group.sections.push(get_section(node)?);
        }
        if group.sections.is_empty() {
            return Err(CfgError::SecListEmpty);
        }
        config.groups.push(group);
    }

    Ok(config)
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn parse_positive(text: &str) -> Option<u32> {
    text.trim().parse::<u32>().ok().filter(|&v| v > 0)
}

fn get_params(node: &XmlElement) -> CfgResult<Params> {
    let mut params = Params::default();
    if let Some(mask) = node.child("domain_mask") {
        params.domain_mask = parse_positive(&mask.text).ok_or(CfgError::ParamInvalidDomainMask)?;
    }
    if let Some(mask) = node.child("socket_mask") {
        params.socket_mask = parse_positive(&mask.text).ok_or(CfgError::ParamInvalidSocketMask)?;
    }
    if let Some(mask) = node.child("device_mask") {
        params.device_mask = parse_positive(&mask.text).ok_or(CfgError::ParamInvalidDeviceMask)?;
    }
    Ok(params)
}

fn get_target(node: &XmlElement) -> CfgResult<Target> {
    match node.attr("target") {
        None => Ok(Target::Cpu),
        Some("cpu") => Ok(Target::Cpu),
        Some("gpu") => Ok(Target::Gpu),
        Some(_) => Err(CfgError::SecInvalidTarget),
    }
}

fn get_interval(node: &XmlElement) -> CfgResult<Duration> {
    // <interval> overrides <freq>
    if let Some(interval) = node.child("interval") {
        let ms = parse_positive(&interval.text).ok_or(CfgError::SecInvalidInterval)?;
        return Ok(Duration::from_millis(ms as u64));
    }
    if let Some(freq) = node.child("freq") {
        let hz: f64 = freq
            .text
            .trim()
            .parse()
            .ok()
            .filter(|&f| f > 0.0)
            .ok_or(CfgError::SecInvalidFreq)?;
        // clamps at 1000 Hz
        let interval = 1000.0 / hz;
        let ms = if interval <= 1.0 { 1 } else { interval as u64 };
        return Ok(Duration::from_millis(ms));
    }
    Err(CfgError::SecNoFreq)
}

fn get_samples(node: &XmlElement, interval: Duration) -> CfgResult<u32> {
    // <duration> converts to a sample count, rounding up
    if let Some(duration) = node.child("duration") {
        let ms = parse_positive(&duration.text).ok_or(CfgError::SecInvalidDuration)? as u64;
        let interval = interval.as_millis() as u64;
        return Ok((ms / interval + u64::from(ms % interval != 0)) as u32);
    }
    if let Some(samples) = node.child("samples") {
        return parse_positive(&samples.text).ok_or(CfgError::SecInvalidSamples);
    }
    Ok(0)
}

fn get_position(node: &XmlElement) -> CfgResult<Position> {
    let cu = node.child("cu").ok_or(CfgError::PosNoCompUnit)?;
    if cu.text.is_empty() {
        return Err(CfgError::PosInvalidCompUnit);
    }
    let line = node.child("line").ok_or(CfgError::PosNoLine)?;
    let line = parse_positive(&line.text).ok_or(CfgError::PosInvalidLine)?;
    Ok(Position {
        compilation_unit: cu.text.clone(),
        line,
    })
}

fn get_bounds(node: &XmlElement) -> CfgResult<Bounds> {
    if let Some(function) = node.child("function") {
        if function.text.is_empty() {
            return Err(CfgError::BoundsInvalidFunction);
        }
        return Ok(Bounds::Function {
            cu: non_empty(function.attr("cu")),
            name: function.text.clone(),
        });
    }
    let start = node.child("start").ok_or(CfgError::BoundsNoStart)?;
    let end = node.child("end").ok_or(CfgError::BoundsNoEnd)?;
    Ok(Bounds::Positions {
        start: get_position(start)?,
        end: get_position(end)?,
    })
}

fn get_method(node: &XmlElement) -> CfgResult<ProfilingMethod> {
    match node.text.trim() {
        "profile" => Ok(ProfilingMethod::EnergyProfile),
        "total" => Ok(ProfilingMethod::EnergyTotal),
        _ => Err(CfgError::SecInvalidMethod),
    }
}

fn get_section(node: &XmlElement) -> CfgResult<Section> {
    let target = get_target(node)?;

    let name = match node.child("name") {
        Some(n) if n.text.is_empty() => return Err(CfgError::SecInvalidName),
        n => n.map(|n| n.text.clone()),
    };
    let extra = match node.child("extra") {
        Some(n) if n.text.is_empty() => return Err(CfgError::SecInvalidExtra),
        n => n.map(|n| n.text.clone()),
    };

    let interval = get_interval(node)?;

    // method only means something for CPU sections: GPU sensors report
    // instantaneous power, so there is no meaningful total
    let mut method = ProfilingMethod::EnergyProfile;
    if let Some(m) = node.child("method") {
        let parsed = get_method(m)?;
        if target == Target::Cpu {
            method = parsed;
        }
    }

    let executions = match node.child("execs") {
        Some(n) => parse_positive(&n.text).ok_or(CfgError::SecInvalidExecs)?,
        None => 0,
    };

    let samples = get_samples(node, interval)?;

    let bounds = node.child("bounds").ok_or(CfgError::SecNoBounds)?;
    let bounds = get_bounds(bounds)?;

    Ok(Section {
        name,
        extra,
        target,
        method,
        bounds,
        interval,
        executions,
        samples,
    })
}

/// A parsed XML element: name, attributes, immediate text, children.
#[derive(Debug, Default)]
struct XmlElement {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<XmlElement>,
}

impl XmlElement {
    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn element_from_start(e: &quick_xml::events::BytesStart) -> CfgResult<XmlElement> {
    let mut element = XmlElement {
        name: String::from_utf8_lossy(e.name().as_ref()).to_string(),
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|_| CfgError::ConfigBadFormat)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|_| CfgError::ConfigBadFormat)?
            .to_string();
        element.attrs.push((key, value));
    }
    Ok(element)
}

/// Parses a document into its root element.
fn parse_tree(text: &str) -> CfgResult<XmlElement> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    loop {
        match reader.read_event().map_err(|_| CfgError::ConfigBadFormat)? {
            Event::Start(e) => stack.push(element_from_start(&e)?),
            Event::Empty(e) => {
                let element = element_from_start(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or(CfgError::ConfigBadFormat)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|_| CfgError::ConfigBadFormat)?;
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(text.trim());
                }
            }
            Event::Eof => return Err(CfgError::ConfigNoConfig),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_SECTION: &str = r#"
        <config>
            <sections>
                <section>
                    <interval>10</interval>
                    <method>profile</method>
                    <samples>5</samples>
                    <bounds>
                        <start><cu>main.c</cu><line>10</line></start>
                        <end><cu>main.c</cu><line>20</line></end>
                    </bounds>
                </section>
            </sections>
        </config>"#;

    #[test]
    fn test_parse_single_section() {
        let config = parse_config(ONE_SECTION).unwrap();
        assert_eq!(config.groups.len(), 1);
        let section = &config.groups[0].sections[0];

        assert_eq!(section.target, Target::Cpu);
        assert_eq!(section.method, ProfilingMethod::EnergyProfile);
        assert_eq!(section.interval, Duration::from_millis(10));
        assert_eq!(section.samples, 5);
        assert_eq!(section.executions, 0);
        assert_eq!(
            section.bounds,
            Bounds::Positions {
                start: Position {
                    compilation_unit: "main.c".into(),
                    line: 10
                },
                end: Position {
                    compilation_unit: "main.c".into(),
                    line: 20
                },
            }
        );
    }

    #[test]
    fn test_invalid_freq() {
        let config = ONE_SECTION.replace("<interval>10</interval>", "<freq>0</freq>");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::SecInvalidFreq);
    }

    #[test]
    fn test_freq_clamped_to_1ms() {
        let config = ONE_SECTION.replace("<interval>10</interval>", "<freq>2000</freq>");
        let config = parse_config(&config).unwrap();
        assert_eq!(
            config.groups[0].sections[0].interval,
            Duration::from_millis(1)
        );

        let config = ONE_SECTION.replace("<interval>10</interval>", "<freq>4</freq>");
        let config = parse_config(&config).unwrap();
        assert_eq!(
            config.groups[0].sections[0].interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_duration_converts_to_samples() {
        let config = ONE_SECTION.replace("<samples>5</samples>", "<duration>105</duration>");
        let config = parse_config(&config).unwrap();
        // ceil(105 / 10)
        assert_eq!(config.groups[0].sections[0].samples, 11);
    }

    #[test]
    fn test_missing_pieces() {
        let config = ONE_SECTION.replace("<interval>10</interval>", "");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::SecNoFreq);

        let config = ONE_SECTION.replace("<cu>main.c</cu><line>10</line>", "<line>10</line>");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::PosNoCompUnit);

        let config = ONE_SECTION.replace("<line>10</line>", "<line>0</line>");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::PosInvalidLine);

        assert_eq!(
            parse_config("<notconfig></notconfig>").unwrap_err(),
            CfgError::ConfigNoConfig
        );
        assert_eq!(
            parse_config("<config><sections/></config>")
                .unwrap_err(),
            CfgError::SecListEmpty
        );
    }

    #[test]
    fn test_gpu_section_ignores_method() {
        let config = ONE_SECTION.replace("<section>", r#"<section target="gpu">"#);
        let config = config.replace("<method>profile</method>", "<method>total</method>");
        let config = parse_config(&config).unwrap();
        let section = &config.groups[0].sections[0];
        assert_eq!(section.target, Target::Gpu);
        assert_eq!(section.method, ProfilingMethod::EnergyProfile);
    }

    #[test]
    fn test_groups_and_function_bounds() {
        let text = r#"
            <config>
                <threads>4</threads>
                <params><domain_mask>3</domain_mask></params>
                <sections label="hot" extra="phase-1">
                    <section>
                        <freq>100</freq>
                        <bounds><function cu="main.c">compute</function></bounds>
                    </section>
                </sections>
                <sections>
                    <section>
                        <interval>20</interval>
                        <bounds>
                            <start><cu>main.c</cu><line>1</line></start>
                            <end><cu>main.c</cu><line>2</line></end>
                        </bounds>
                    </section>
                </sections>
            </config>"#;
        let config = parse_config(text).unwrap();

        assert_eq!(config.threads, 4);
        assert_eq!(config.parameters.domain_mask, 3);
        assert_eq!(config.parameters.socket_mask, !0);
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[0].label.as_deref(), Some("hot"));
        assert_eq!(config.groups[0].extra.as_deref(), Some("phase-1"));
        assert_eq!(
            config.groups[0].sections[0].bounds,
            Bounds::Function {
                cu: Some("main.c".into()),
                name: "compute".into()
            }
        );
        assert_eq!(config.groups[0].sections[0].interval, Duration::from_millis(10));
        assert_eq!(config.sections().count(), 2);
    }

    #[test]
    fn test_invalid_masks_and_execs() {
        let config = ONE_SECTION.replace(
            "<sections>",
            "<params><socket_mask>0</socket_mask></params><sections>",
        );
        assert_eq!(
            parse_config(&config).unwrap_err(),
            CfgError::ParamInvalidSocketMask
        );

        let config = ONE_SECTION.replace("<method>profile</method>", "<execs>0</execs>");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::SecInvalidExecs);

        let config = ONE_SECTION.replace("<method>profile</method>", "<method>best</method>");
        assert_eq!(parse_config(&config).unwrap_err(), CfgError::SecInvalidMethod);
    }
}
