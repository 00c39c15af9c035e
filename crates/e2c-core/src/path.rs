use e2c_error::E2cError;
use std::fmt;
use std::str::FromStr;

/// A validated absolute path, split into owned components.
///
/// Accepted: `/` (no components) and `/a/b/...` with every component
/// non-empty. Rejected with [`E2cError::InvalidPath`]: the empty string,
/// relative paths, `//` anywhere, and a trailing `/` on anything but the
/// root. `.` and `..` are ordinary names and are looked up literally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ext2Path {
    components: Vec<String>,
}

impl Ext2Path {
    pub fn parse(path: &str) -> Result<Self, E2cError> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(E2cError::InvalidPath(format!(
                "{path:?} is not absolute"
            )));
        };
        if rest.is_empty() {
            return Ok(Self::root());
        }

        let mut components = Vec::new();
        for component in rest.split('/') {
            if component.is_empty() {
                return Err(E2cError::InvalidPath(format!(
                    "{path:?} has an empty component"
                )));
            }
            components.push(component.to_owned());
        }
        Ok(Self { components })
    }

    #[must_use]
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Number of components; 0 for the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }
}

impl FromStr for Ext2Path {
    type Err = E2cError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Ext2Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}
