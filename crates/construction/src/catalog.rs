use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};

use crate::types::{ResourceKind, VOID_KINDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogErrorCode {
    ReadFile,
    XmlMalformed,
    InvalidRoot,
    UnknownDefType,
    UnknownField,
    DuplicateField,
    MissingField,
    InvalidValue,
    DuplicateContent,
}

#[derive(Debug, Clone)]
pub struct CatalogError {
    pub code: CatalogErrorCode,
    pub message: String,
    pub file_path: PathBuf,
    pub location: Option<SourceLocation>,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(loc) => write!(
                f,
                "{:?}: {} (file={}, line={}, column={})",
                self.code,
                self.message,
                self.file_path.display(),
                loc.line,
                loc.column
            ),
            None => write!(
                f,
                "{:?}: {} (file={})",
                self.code,
                self.message,
                self.file_path.display()
            ),
        }
    }
}

impl std::error::Error for CatalogError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialMapping {
    pub resource: ResourceKind,
    /// Resource units charged per placed unit of the content kind.
    pub units: u32,
}

/// Maps content kinds to the storable resources that pay for them.
///
/// Kinds without a mapping cost nothing, unless the catalog is in
/// passthrough mode, in which case they cost one unit of a resource with
/// the same name. Void kinds never cost anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterialCatalog {
    mappings: BTreeMap<String, MaterialMapping>,
    passthrough: bool,
}

impl MaterialCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn passthrough() -> Self {
        Self {
            mappings: BTreeMap::new(),
            passthrough: true,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    pub fn with_mapping(
        mut self,
        content_kind: impl Into<String>,
        resource: impl Into<String>,
        units: u32,
    ) -> Self {
        self.mappings.insert(
            content_kind.into(),
            MaterialMapping {
                resource: ResourceKind::new(resource),
                units,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn resolve(&self, content_kind: &str) -> Option<MaterialMapping> {
        if VOID_KINDS.contains(&content_kind) {
            return None;
        }
        if let Some(mapping) = self.mappings.get(content_kind) {
            return Some(mapping.clone());
        }
        self.passthrough.then(|| MaterialMapping {
            resource: ResourceKind::new(content_kind),
            units: 1,
        })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path).map_err(|source| CatalogError {
            code: CatalogErrorCode::ReadFile,
            message: format!("failed to read material defs: {source}"),
            file_path: path.to_path_buf(),
            location: None,
        })?;
        Self::parse(path, &raw)
    }

    /// Parses a `<Defs>` document of `<MaterialDef>` entries. `file_path`
    /// only labels errors.
    pub fn parse(file_path: &Path, raw: &str) -> Result<Self, CatalogError> {
        let doc = Document::parse(raw).map_err(|error| CatalogError {
            code: CatalogErrorCode::XmlMalformed,
            message: format!("malformed XML: {error}"),
            file_path: file_path.to_path_buf(),
            location: Some(SourceLocation {
                line: error.pos().row as usize,
                column: error.pos().col as usize,
            }),
        })?;

        let root = doc.root_element();
        if root.tag_name().name() != "Defs" {
            return Err(error_at_node(
                CatalogErrorCode::InvalidRoot,
                "root element must be <Defs>".to_string(),
                file_path,
                &doc,
                root,
            ));
        }
        let passthrough = match root.attribute("passthrough") {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(error_at_node(
                    CatalogErrorCode::InvalidValue,
                    format!("passthrough '{other}' must be true or false"),
                    file_path,
                    &doc,
                    root,
                ))
            }
        };

        let mut mappings = BTreeMap::<String, MaterialMapping>::new();
        for child in root.children().filter(|node| node.is_element()) {
            if child.tag_name().name() != "MaterialDef" {
                return Err(error_at_node(
                    CatalogErrorCode::UnknownDefType,
                    format!(
                        "unsupported def type <{}>; expected <MaterialDef>",
                        child.tag_name().name()
                    ),
                    file_path,
                    &doc,
                    child,
                ));
            }
            let (content, mapping) = parse_material_def(file_path, &doc, child)?;
            if mappings.contains_key(&content) {
                return Err(error_at_node(
                    CatalogErrorCode::DuplicateContent,
                    format!("content '{content}' is mapped more than once"),
                    file_path,
                    &doc,
                    child,
                ));
            }
            mappings.insert(content, mapping);
        }

        Ok(Self {
            mappings,
            passthrough,
        })
    }
}

fn parse_material_def(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
) -> Result<(String, MaterialMapping), CatalogError> {
    let mut seen_fields = HashSet::<String>::new();
    let mut content: Option<String> = None;
    let mut resource: Option<String> = None;
    let mut units: Option<u32> = None;

    for field in node.children().filter(|child| child.is_element()) {
        let field_name = field.tag_name().name().to_string();
        if !seen_fields.insert(field_name.clone()) {
            return Err(error_at_node(
                CatalogErrorCode::DuplicateField,
                format!("duplicate field <{field_name}> in <MaterialDef>"),
                file_path,
                doc,
                field,
            ));
        }

        match field_name.as_str() {
            "content" => content = Some(required_text(file_path, doc, field, "content")?),
            "resource" => resource = Some(required_text(file_path, doc, field, "resource")?),
            "units" => {
                let value = required_text(file_path, doc, field, "units")?;
                let parsed = value.parse::<u32>().map_err(|_| {
                    error_at_node(
                        CatalogErrorCode::InvalidValue,
                        format!("units '{value}' is not a non-negative integer"),
                        file_path,
                        doc,
                        field,
                    )
                })?;
                units = Some(parsed);
            }
            _ => {
                return Err(error_at_node(
                    CatalogErrorCode::UnknownField,
                    format!("unknown field <{field_name}> in <MaterialDef>"),
                    file_path,
                    doc,
                    field,
                ))
            }
        }
    }

    let Some(content) = content else {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            "missing required field <content> in <MaterialDef>".to_string(),
            file_path,
            doc,
            node,
        ));
    };
    if VOID_KINDS.contains(&content.as_str()) {
        return Err(error_at_node(
            CatalogErrorCode::InvalidValue,
            format!("void content '{content}' cannot carry a material cost"),
            file_path,
            doc,
            node,
        ));
    }
    let Some(resource) = resource else {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            "missing required field <resource> in <MaterialDef>".to_string(),
            file_path,
            doc,
            node,
        ));
    };

    Ok((
        content,
        MaterialMapping {
            resource: ResourceKind::new(resource),
            units: units.unwrap_or(1),
        },
    ))
}

fn required_text(
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
    field_name: &str,
) -> Result<String, CatalogError> {
    let value = node.text().map(str::trim).unwrap_or_default().to_string();
    if value.is_empty() {
        return Err(error_at_node(
            CatalogErrorCode::MissingField,
            format!("field <{field_name}> must not be empty"),
            file_path,
            doc,
            node,
        ));
    }
    Ok(value)
}

fn error_at_node(
    code: CatalogErrorCode,
    message: String,
    file_path: &Path,
    doc: &Document<'_>,
    node: Node<'_, '_>,
) -> CatalogError {
    let pos = doc.text_pos_at(node.range().start);
    CatalogError {
        code,
        message,
        file_path: file_path.to_path_buf(),
        location: Some(SourceLocation {
            line: pos.row as usize,
            column: pos.col as usize,
        }),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn parse(raw: &str) -> Result<MaterialCatalog, CatalogError> {
        MaterialCatalog::parse(Path::new("materials.xml"), raw)
    }

    #[test]
    fn parses_mappings_with_default_units() {
        let catalog = parse(
            r#"<Defs>
                <MaterialDef>
                    <content>oak_planks</content>
                    <resource>planks</resource>
                </MaterialDef>
                <MaterialDef>
                    <content>oak_slab</content>
                    <resource>planks</resource>
                    <units>0</units>
                </MaterialDef>
                <MaterialDef>
                    <content>stone_bricks</content>
                    <resource>stone</resource>
                    <units>2</units>
                </MaterialDef>
            </Defs>"#,
        )
        .expect("parse");

        assert_eq!(catalog.len(), 3);
        assert_eq!(
            catalog.resolve("oak_planks"),
            Some(MaterialMapping {
                resource: ResourceKind::new("planks"),
                units: 1
            })
        );
        assert_eq!(catalog.resolve("stone_bricks").map(|m| m.units), Some(2));
        assert_eq!(catalog.resolve("oak_slab").map(|m| m.units), Some(0));
        assert_eq!(catalog.resolve("glass"), None);
    }

    #[test]
    fn passthrough_maps_unknown_kinds_to_themselves_but_not_void() {
        let catalog = parse(r#"<Defs passthrough="true"/>"#).expect("parse");
        assert!(catalog.is_passthrough());
        assert_eq!(
            catalog.resolve("glass").map(|m| m.resource),
            Some(ResourceKind::new("glass"))
        );
        assert_eq!(catalog.resolve("air"), None);
        assert_eq!(catalog.resolve("structure_void"), None);
    }

    #[test]
    fn missing_resource_reports_location() {
        let error = parse("<Defs>\n  <MaterialDef>\n    <content>x</content>\n  </MaterialDef>\n</Defs>")
            .expect_err("missing resource");
        assert_eq!(error.code, CatalogErrorCode::MissingField);
        assert_eq!(error.location.map(|loc| loc.line), Some(2));
        assert!(error.to_string().contains("materials.xml"));
    }

    #[test]
    fn rejects_unknown_fields_and_def_types() {
        let unknown_field = parse(
            "<Defs><MaterialDef><content>a</content><resource>b</resource><color>red</color></MaterialDef></Defs>",
        )
        .expect_err("unknown field");
        assert_eq!(unknown_field.code, CatalogErrorCode::UnknownField);

        let unknown_def = parse("<Defs><EntityDef/></Defs>").expect_err("unknown def");
        assert_eq!(unknown_def.code, CatalogErrorCode::UnknownDefType);

        let bad_root = parse("<Materials/>").expect_err("bad root");
        assert_eq!(bad_root.code, CatalogErrorCode::InvalidRoot);
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let duplicate_field = parse(
            "<Defs><MaterialDef><content>a</content><content>b</content></MaterialDef></Defs>",
        )
        .expect_err("dup field");
        assert_eq!(duplicate_field.code, CatalogErrorCode::DuplicateField);

        let duplicate_content = parse(
            "<Defs>\
             <MaterialDef><content>a</content><resource>r</resource></MaterialDef>\
             <MaterialDef><content>a</content><resource>s</resource></MaterialDef>\
             </Defs>",
        )
        .expect_err("dup content");
        assert_eq!(duplicate_content.code, CatalogErrorCode::DuplicateContent);

        let negative = parse(
            "<Defs><MaterialDef><content>a</content><resource>r</resource><units>-1</units></MaterialDef></Defs>",
        )
        .expect_err("negative units");
        assert_eq!(negative.code, CatalogErrorCode::InvalidValue);

        let void = parse(
            "<Defs><MaterialDef><content>air</content><resource>r</resource></MaterialDef></Defs>",
        )
        .expect_err("void content");
        assert_eq!(void.code, CatalogErrorCode::InvalidValue);
    }

    #[test]
    fn malformed_xml_reports_location() {
        let error = parse("<Defs><MaterialDef></Defs>").expect_err("malformed");
        assert_eq!(error.code, CatalogErrorCode::XmlMalformed);
        assert!(error.location.is_some());
    }

    #[test]
    fn load_reads_file_or_reports_read_error() {
        let temp = TempDir::new().expect("temp");
        let path = temp.path().join("materials.xml");
        let missing = MaterialCatalog::load(&path).expect_err("missing file");
        assert_eq!(missing.code, CatalogErrorCode::ReadFile);

        fs::write(
            &path,
            "<Defs><MaterialDef><content>cobblestone</content><resource>stone</resource></MaterialDef></Defs>",
        )
        .expect("write");
        let catalog = MaterialCatalog::load(&path).expect("load");
        assert_eq!(
            catalog.resolve("cobblestone").map(|m| m.resource),
            Some(ResourceKind::new("stone"))
        );
    }
}
