use colored::*;
use connectrpc_core::{
    ConnectError,
    prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor},
};

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

/// Every service of a descriptor pool, with its methods.
pub struct ServiceList(pub DescriptorPool);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<serde_json::Value> for FormattedString {
    fn from(value: serde_json::Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<&ConnectError> for FormattedString {
    fn from(error: &ConnectError) -> Self {
        let mut out = format!(
            "{} code={} message={:?}",
            "Call Failed:".red().bold(),
            error.code.to_string().yellow(),
            error.message().unwrap_or_default()
        );
        for detail in &error.details {
            out.push_str(&format!("\n  detail: {}", detail.type_url.cyan()));
        }
        FormattedString(out)
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        FormattedString(format!("{}\n\n'{:#}'", "Error:".red().bold(), err))
    }
}

impl From<ServiceList> for FormattedString {
    fn from(ServiceList(pool): ServiceList) -> Self {
        let mut services = pool.services().peekable();
        if services.peek().is_none() {
            return FormattedString("No services found.".yellow().to_string());
        }

        let mut out = String::new();
        for service in services {
            out.push_str(&FormattedString::from(service).0);
            out.push_str("\n\n");
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<ServiceDescriptor> for FormattedString {
    fn from(service: ServiceDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "service".cyan(),
            service.full_name().green()
        ));

        for method in service.methods() {
            out.push_str("  ");
            out.push_str(&FormattedString::from(method).0);
            out.push('\n');
        }
        out.push('}');
        FormattedString(out)
    }
}

impl From<MethodDescriptor> for FormattedString {
    fn from(method: MethodDescriptor) -> Self {
        let stream = |streaming: bool| {
            if streaming {
                format!("{} ", "stream".cyan())
            } else {
                String::new()
            }
        };

        FormattedString(format!(
            "{} {}({}{}) {} ({}{});",
            "rpc".cyan(),
            method.name().green(),
            stream(method.is_client_streaming()),
            method.input().full_name().yellow(),
            "returns".cyan(),
            stream(method.is_server_streaming()),
            method.output().full_name().yellow()
        ))
    }
}
