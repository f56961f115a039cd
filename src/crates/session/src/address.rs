//! Addressing of circuit, analysis, and instance parameters, compiled to engine commands.

use std::fmt;

use crate::sexpr::quote;

/// Attribute used when a parameter is read or written without naming one.
pub const DEFAULT_ATTRIBUTE: &str = "value";

/// The owner a parameter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Circuit,
    Analysis(String),
    Instance(String),
}

impl OwnerKind {
    pub fn analysis(name: impl Into<String>) -> Self {
        OwnerKind::Analysis(name.into())
    }

    pub fn instance(name: impl Into<String>) -> Self {
        OwnerKind::Instance(name.into())
    }

    /// Expression that resolves to the owner object inside the engine.
    pub fn handle(&self) -> String {
        match self {
            OwnerKind::Circuit => format!("(sclGetCircuit {})", quote("")),
            OwnerKind::Analysis(name) => format!("(sclGetAnalysis {})", quote(name)),
            OwnerKind::Instance(name) => format!("(sclGetInstance {})", quote(name)),
        }
    }
}

/// Top-level collections that can be enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Analyses,
    Instances,
    Nets,
}

impl ChildKind {
    fn function(self) -> &'static str {
        match self {
            ChildKind::Analyses => "sclListAnalysis",
            ChildKind::Instances => "sclListInstance",
            ChildKind::Nets => "sclListNet",
        }
    }
}

/// A parameter of some owner, plus the attribute to access.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterAddress {
    pub owner: OwnerKind,
    pub parameter: String,
    pub attribute: Option<String>,
}

impl ParameterAddress {
    pub fn new(owner: OwnerKind, parameter: impl Into<String>) -> Self {
        Self {
            owner,
            parameter: parameter.into(),
            attribute: None,
        }
    }

    /// Circuit-level parameter addressed through its `value` attribute.
    pub fn circuit(parameter: impl Into<String>) -> Self {
        Self::new(OwnerKind::Circuit, parameter)
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn attribute(&self) -> &str {
        self.attribute.as_deref().unwrap_or(DEFAULT_ATTRIBUTE)
    }

    fn parameter_handle(&self) -> String {
        format!(
            "(sclGetParameter {} {})",
            self.owner.handle(),
            quote(&self.parameter)
        )
    }
}

/// Value written into an attribute. Numbers are sent bare, text is quoted.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Number(value) => write!(f, "{value:e}"),
            AttributeValue::Text(text) => f.write_str(&quote(text)),
        }
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

/// Textual engine commands.
pub mod command {
    use super::*;

    pub const QUIT: &str = "(sclQuit)";

    pub fn run_all() -> String {
        format!("(sclRun {})", quote("all"))
    }

    pub fn run_analysis(name: &str) -> String {
        format!("(sclRunAnalysis {})", OwnerKind::analysis(name).handle())
    }

    pub fn list_children(kind: ChildKind) -> String {
        format!("({})", kind.function())
    }

    pub fn list_parameters(owner: &OwnerKind) -> String {
        format!("(sclListParameter {})", owner.handle())
    }

    pub fn list_attributes(address: &ParameterAddress) -> String {
        format!("(sclListAttribute {})", address.parameter_handle())
    }

    pub fn get_attribute(address: &ParameterAddress) -> String {
        format!(
            "(sclGetAttribute {} {})",
            address.parameter_handle(),
            quote(address.attribute())
        )
    }

    pub fn set_attribute(address: &ParameterAddress, value: &AttributeValue) -> String {
        format!(
            "(sclSetAttribute {} {} {value})",
            address.parameter_handle(),
            quote(address.attribute())
        )
    }

    pub fn create_analysis(analysis_type: &str, name: &str) -> String {
        format!("(sclCreateAnalysis {} {})", quote(name), quote(analysis_type))
    }
}

#[cfg(test)]
mod tests {
    use super::command;
    use super::*;
    use crate::sexpr;

    #[test]
    fn circuit_parameters_use_value_attribute() {
        let address = ParameterAddress::circuit("W");
        assert_eq!(
            command::set_attribute(&address, &1.5e-6.into()),
            r#"(sclSetAttribute (sclGetParameter (sclGetCircuit "") "W") "value" 1.5e-6)"#
        );
        assert_eq!(
            command::get_attribute(&address),
            r#"(sclGetAttribute (sclGetParameter (sclGetCircuit "") "W") "value")"#
        );
    }

    #[test]
    fn owner_kinds_share_one_command_shape() {
        let analysis = ParameterAddress::new(OwnerKind::analysis("tran1"), "stop")
            .with_attribute("value");
        assert_eq!(
            command::set_attribute(&analysis, &"2u".into()),
            r#"(sclSetAttribute (sclGetParameter (sclGetAnalysis "tran1") "stop") "value" "2u")"#
        );

        let instance = ParameterAddress::new(OwnerKind::instance("M0"), "w");
        assert_eq!(
            command::list_attributes(&instance),
            r#"(sclListAttribute (sclGetParameter (sclGetInstance "M0") "w"))"#
        );
        assert_eq!(
            command::list_parameters(&OwnerKind::instance("M0")),
            r#"(sclListParameter (sclGetInstance "M0"))"#
        );
    }

    #[test]
    fn fixed_commands() {
        assert_eq!(command::run_all(), r#"(sclRun "all")"#);
        assert_eq!(
            command::run_analysis("ac1"),
            r#"(sclRunAnalysis (sclGetAnalysis "ac1"))"#
        );
        assert_eq!(command::list_children(ChildKind::Nets), "(sclListNet)");
        assert_eq!(
            command::create_analysis("tran", "tran2"),
            r#"(sclCreateAnalysis "tran2" "tran")"#
        );
    }

    #[test]
    fn compiled_commands_parse_with_quoted_names() {
        let address = ParameterAddress::new(OwnerKind::instance("M(0"), "w)\"");
        for cmd in [
            command::get_attribute(&address),
            command::list_attributes(&address),
            command::set_attribute(&address, &"x".into()),
        ] {
            assert!(sexpr::parse(&cmd).is_ok(), "{cmd}");
            assert!(sexpr::is_balanced(&cmd), "{cmd}");
        }
    }

    #[test]
    fn quoted_names_pass_the_channel_guard() {
        let owner = OwnerKind::analysis("sweep(a)");
        for cmd in [
            command::run_analysis("tran)"),
            command::create_analysis("tran", "x(1"),
            command::list_parameters(&owner),
            command::list_children(ChildKind::Instances),
        ] {
            assert!(sexpr::is_balanced(&cmd), "{cmd}");
        }
    }
}
