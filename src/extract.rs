use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::{
    collapse::collapse_last_by_key,
    error::{ImportError, MalformedInput},
    ids::IdGenerator,
    models::{
        ElementRecord, PropertyBag, RawFile, RawId, RawObject, RawProperty, RawType, TypeRecord,
    },
    relate::map_items_as_related,
};

const FAMILY_KEY: &str = "Revit Family";
const TYPE_NAME_KEY: &str = "Revit Type";
const CATEGORY_KEY: &str = "Revit Category";
const SYSTEM_ELEMENT_ID: &str = "System.elementId";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementTypeRelation {
    pub element_id: String,
    pub type_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub elements: Vec<ElementRecord>,
    pub types: Vec<TypeRecord>,
    pub properties: Vec<PropertyBag>,
    pub relations: Vec<ElementTypeRelation>,
}

pub fn extract_package(
    files: &[RawFile],
    ids: &dyn IdGenerator,
) -> Result<Extraction, ImportError> {
    run_extraction(files, ids).inspect_err(|err| error!("Data extraction failed: {err}"))
}

fn run_extraction(files: &[RawFile], ids: &dyn IdGenerator) -> Result<Extraction, ImportError> {
    let mut out = Extraction::default();
    // first type registered under an external id wins, like a linear find
    let mut type_index: HashMap<RawId, usize> = HashMap::new();

    for file in files {
        for (occurrence_no, occurrence) in file.occurrences.iter().enumerate() {
            let content = &occurrence.content;
            let scope = DefinitionScope::new(&file.name, occurrence_no, &content.properties);

            for raw_type in &content.types {
                let record = build_type(raw_type, &scope, ids)?;
                type_index
                    .entry(record.external_id.clone())
                    .or_insert(out.types.len());
                out.types.push(record);
            }

            for object in &content.objects {
                let type_record = type_index
                    .get(&object.type_id)
                    .map(|&idx| &out.types[idx])
                    .ok_or_else(|| MalformedInput::UnknownType {
                        file: file.name.clone(),
                        object_id: object.id.to_string(),
                        type_id: object.type_id.to_string(),
                    })?;
                let (element, bag) = build_element(object, type_record, &file.name, &scope, ids)?;
                out.elements.push(element);
                out.properties.push(bag);
            }

            debug!(
                file = %file.name,
                occurrence = occurrence_no,
                types = content.types.len(),
                objects = content.objects.len(),
                definitions = content.properties.len(),
                "Occurrence extracted"
            );
        }
    }

    out.relations = map_items_as_related(&out.elements, &out.types, "type_id", "id")?
        .into_iter()
        .map(|related| ElementTypeRelation {
            element_id: related.parent_item.internal_id.clone(),
            type_ids: related
                .related_items
                .iter()
                .map(|t| t.internal_id.clone())
                .collect(),
        })
        .collect();

    info!(
        elements = out.elements.len(),
        types = out.types.len(),
        property_bags = out.properties.len(),
        relations = out.relations.len(),
        "Data extraction is complete"
    );
    Ok(out)
}

struct DefinitionScope<'a> {
    file: &'a str,
    occurrence: usize,
    by_id: HashMap<&'a RawId, &'a RawProperty>,
    by_text: HashMap<String, &'a RawProperty>,
}

impl<'a> DefinitionScope<'a> {
    fn new(file: &'a str, occurrence: usize, definitions: &'a [RawProperty]) -> Self {
        let mut by_id = HashMap::with_capacity(definitions.len());
        let mut by_text = HashMap::with_capacity(definitions.len());
        for def in definitions {
            by_id.entry(&def.id).or_insert(def);
            by_text.entry(def.id.to_string()).or_insert(def);
        }
        Self {
            file,
            occurrence,
            by_id,
            by_text,
        }
    }

    fn resolve(
        &self,
        reference: &RawProperty,
        owner: &str,
    ) -> Result<&'a RawProperty, MalformedInput> {
        self.by_id
            .get(&reference.id)
            .copied()
            .ok_or_else(|| self.unknown(reference, owner))
    }

    // object references may spell a numeric id as a string and vice versa
    fn resolve_loose(
        &self,
        reference: &RawProperty,
        owner: &str,
    ) -> Result<&'a RawProperty, MalformedInput> {
        self.by_text
            .get(&reference.id.to_string())
            .copied()
            .ok_or_else(|| self.unknown(reference, owner))
    }

    fn unknown(&self, reference: &RawProperty, owner: &str) -> MalformedInput {
        MalformedInput::UnknownProperty {
            file: self.file.to_string(),
            occurrence: self.occurrence,
            owner: owner.to_string(),
            property_id: reference.id.to_string(),
        }
    }
}

fn enrich(reference: &RawProperty, definition: &RawProperty) -> RawProperty {
    let mut prop = reference.clone();
    prop.display_name = definition.display_name.clone();
    prop.source_type = definition.source_type.clone();
    if definition.display_override.is_some() {
        prop.display_override = definition.display_override.clone();
    }
    prop
}

fn display_name_key(prop: &RawProperty) -> Result<&str, MalformedInput> {
    prop.display_name
        .as_deref()
        .ok_or_else(|| MalformedInput::MissingDisplayName {
            property_id: prop.id.to_string(),
        })
}

fn build_type(
    raw: &RawType,
    scope: &DefinitionScope<'_>,
    ids: &dyn IdGenerator,
) -> Result<TypeRecord, ImportError> {
    let owner = format!("type {}", raw.id);
    let mut classification = None;
    let mut props = Vec::with_capacity(raw.properties.len());

    for reference in &raw.properties {
        let definition = scope.resolve(reference, &owner)?;
        if let Some(hint) = &definition.category_hint {
            classification = Some(hint.clone());
        }
        props.push(enrich(reference, definition));
    }

    Ok(TypeRecord {
        internal_id: ids.new_id(),
        external_id: raw.id.clone(),
        name: raw.name.clone(),
        source_id: raw.source_id.clone(),
        classification,
        properties: collapse_last_by_key(props, display_name_key)?,
    })
}

fn build_element(
    object: &RawObject,
    type_record: &TypeRecord,
    file_name: &str,
    scope: &DefinitionScope<'_>,
    ids: &dyn IdGenerator,
) -> Result<(ElementRecord, PropertyBag), ImportError> {
    let owner = format!("object {}", object.id);
    let mut system_element_id = None;
    let mut props = Vec::with_capacity(object.properties.len());

    for reference in &object.properties {
        let definition = scope.resolve_loose(reference, &owner)?;
        let prop = enrich(reference, definition);
        if prop.name.as_deref() == Some(SYSTEM_ELEMENT_ID) {
            system_element_id = Some(prop.clone());
        }
        props.push(prop);
    }

    let element = ElementRecord {
        internal_id: ids.new_id(),
        package_id: object.id.clone(),
        type_id: object.type_id.clone(),
        source_id: object.source_id.clone(),
        relationships: object.relationships.clone(),
        source_filename: file_name.to_string(),
        classification: type_record.classification.clone(),
        family: type_record.properties.get(FAMILY_KEY).cloned(),
        type_name: type_record.properties.get(TYPE_NAME_KEY).cloned(),
        category: type_record.properties.get(CATEGORY_KEY).cloned(),
        system_element_id,
    };
    let bag = PropertyBag {
        element_id: element.internal_id.clone(),
        properties: collapse_last_by_key(props, display_name_key)?,
    };
    Ok((element, bag))
}
