use std::collections::HashMap;
use std::path::PathBuf;

/// What to spawn. `${VAR}` occurrences in argv, cwd and env values are
/// replaced from the caller-supplied context before the process starts;
/// unknown variables are left untouched so spawn failures point at the
/// offending literal.
#[derive(Debug, Clone, Default)]
pub struct ShellSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub labels: Vec<String>,
}

impl ShellSpec {
    pub fn command(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn interpolate(&self, ctx: &HashMap<String, String>) -> ShellSpec {
        let subst = |s: &str| -> String {
            let mut out = s.to_string();
            for (key, value) in ctx {
                out = out.replace(&format!("${{{key}}}"), value);
            }
            out
        };
        ShellSpec {
            argv: self.argv.iter().map(|a| subst(a)).collect(),
            cwd: self
                .cwd
                .as_ref()
                .map(|p| PathBuf::from(subst(&p.to_string_lossy()))),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), subst(v)))
                .collect(),
            labels: self.labels.clone(),
        }
    }
}
