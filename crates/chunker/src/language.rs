/// Language family derived from a file extension, used for symbol heuristics
/// and the `lang` metadata tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Kotlin,
    Go,
    Rust,
    Cpp,
    CSharp,
    Markdown,
    Text,
    Unknown,
}

impl Language {
    #[must_use]
    pub fn from_ext(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "py" => Self::Python,
            "js" | "jsx" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "java" => Self::Java,
            "kt" => Self::Kotlin,
            "go" => Self::Go,
            "rs" => Self::Rust,
            "cpp" | "c" | "h" => Self::Cpp,
            "cs" => Self::CSharp,
            "md" => Self::Markdown,
            "txt" | "rst" => Self::Text,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::Kotlin => "kotlin",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Markdown => "markdown",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn is_code(self) -> bool {
        !matches!(self, Self::Markdown | Self::Text | Self::Unknown)
    }

    /// Line-start patterns that open a new top-level symbol.
    #[must_use]
    pub fn symbol_markers(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["def ", "class ", "async def "],
            Self::JavaScript | Self::TypeScript => &[
                "function ",
                "class ",
                "export function ",
                "export class ",
                "export default function ",
                "export const ",
                "const ",
            ],
            Self::Java | Self::CSharp => &[
                "public ", "private ", "protected ", "class ", "interface ", "enum ",
            ],
            Self::Kotlin => &["fun ", "class ", "object ", "interface "],
            Self::Go => &["func ", "type "],
            Self::Rust => &[
                "fn ",
                "pub fn ",
                "pub(crate) fn ",
                "struct ",
                "pub struct ",
                "enum ",
                "pub enum ",
                "impl ",
                "trait ",
                "pub trait ",
                "mod ",
                "pub mod ",
            ],
            Self::Cpp => &["class ", "struct ", "void ", "int ", "template"],
            _ => &[],
        }
    }
}

/// Best-effort symbol name following a marker, e.g. `fn build(` → `build`.
#[must_use]
pub fn symbol_name_after(line: &str, marker: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix(marker)?;
    let name: String = rest
        .chars()
        .take_while(|ch| ch.is_alphanumeric() || *ch == '_')
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_mapping() {
        assert_eq!(Language::from_ext(".py"), Language::Python);
        assert_eq!(Language::from_ext("rs"), Language::Rust);
        assert_eq!(Language::from_ext(".tsx"), Language::TypeScript);
        assert_eq!(Language::from_ext(".rst"), Language::Text);
        assert_eq!(Language::from_ext(".weird"), Language::Unknown);
    }

    #[test]
    fn symbol_name_extraction() {
        assert_eq!(
            symbol_name_after("def build_packet(input):", "def "),
            Some("build_packet".to_string())
        );
        assert_eq!(
            symbol_name_after("pub fn scan(&self) -> u32 {", "pub fn "),
            Some("scan".to_string())
        );
        assert_eq!(symbol_name_after("def (", "def "), None);
    }
}
