use ahash::AHashMap;

/// The launch descriptor for a component process.
///
/// Argument entries may contain `{name}` placeholders which are
/// resolved against a caller-supplied variable table with
/// [`CommandTemplate::resolve`] before the command is spawned.
/// Unresolved placeholders are a declaration error surfaced at
/// resolve time, not at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }

    /// Substitute every `{name}` placeholder in the program, the
    /// arguments, and the environment values.
    pub fn resolve(
        &self,
        vars: &AHashMap<String, String>,
    ) -> Result<CommandTemplate, UnresolvedPlaceholder> {
        Ok(CommandTemplate {
            program: substitute(&self.program, vars)?,
            args: self
                .args
                .iter()
                .map(|a| substitute(a, vars))
                .collect::<Result<_, _>>()?,
            env: self
                .env
                .iter()
                .map(|(k, v)| Ok((k.clone(), substitute(v, vars)?)))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// A `{name}` placeholder had no entry in the variable table.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unresolved placeholder {{{name}}} in command `{text}`")]
pub struct UnresolvedPlaceholder {
    pub name: String,
    pub text: String,
}

fn substitute(
    text: &str,
    vars: &AHashMap<String, String>,
) -> Result<String, UnresolvedPlaceholder> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let brace = rest.as_bytes()[pos];
        rest = &rest[pos + 1..];

        if brace == b'}' {
            // `}}` escapes to a literal brace; a lone `}` is literal.
            if let Some(stripped) = rest.strip_prefix('}') {
                rest = stripped;
            }
            out.push('}');
            continue;
        }

        // `{{` escapes a literal brace.
        if let Some(stripped) = rest.strip_prefix('{') {
            out.push('{');
            rest = stripped;
            continue;
        }

        let Some(close) = rest.find('}') else {
            out.push('{');
            break;
        };
        let name = &rest[..close];
        match vars.get(name) {
            Some(val) => out.push_str(val),
            None => {
                return Err(UnresolvedPlaceholder {
                    name: name.to_string(),
                    text: text.to_string(),
                })
            }
        }
        rest = &rest[close + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> AHashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolves_placeholders_in_args_and_env() {
        let cmd = CommandTemplate::new("client")
            .arg("--server")
            .arg("{server}")
            .env("MODEL", "{model}")
            .resolve(&vars(&[("server", "mediator:4448"), ("model", "en-EU")]))
            .unwrap();

        assert_eq!(cmd.arguments(), &["--server", "mediator:4448"]);
        assert_eq!(cmd.environment(), &[("MODEL".to_string(), "en-EU".to_string())]);
    }

    #[test]
    fn unresolved_placeholder_is_an_error() {
        let err = CommandTemplate::new("client")
            .arg("{missing}")
            .resolve(&vars(&[]))
            .unwrap_err();
        assert_eq!(err.name, "missing");
    }

    #[test]
    fn double_brace_escapes() {
        let cmd = CommandTemplate::new("awk")
            .arg("{{print $1}}")
            .resolve(&vars(&[]))
            .unwrap();
        assert_eq!(cmd.arguments(), &["{print $1}"]);
    }
}
