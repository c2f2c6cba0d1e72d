use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::atomic_io::write_bytes_atomic;
use crate::types::{BlueprintId, ContentState, ExtraData, IntVec3, TagValue};

use super::{Blueprint, BlueprintError, BlueprintUnit, ValidationLimits};

const MAGIC: &[u8; 4] = b"SBLU";
pub const BLUEPRINT_FORMAT_VERSION: u16 = 1;
pub const BLUEPRINT_FILE_EXTENSION: &str = "blueprint";

const UNIT_FLAG_EXTRA_DATA: u8 = 1 << 0;
const MAX_TAG_DEPTH: usize = 32;

const TAG_BYTE: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_LIST: u8 = 7;
const TAG_COMPOUND: u8 = 8;

/// Encodes `blueprint` into the v1 binary layout. Units are written in
/// build order so re-encoding a decoded blueprint is byte-stable.
pub fn encode_blueprint(blueprint: &Blueprint) -> Result<Vec<u8>, BlueprintError> {
    let id = blueprint.id();
    let mut palette = Vec::<&ContentState>::new();
    let mut palette_index = HashMap::<&ContentState, u16>::new();
    let mut units_payload = Vec::<u8>::new();

    for unit in blueprint.units_in_build_order() {
        let index = match palette_index.get(&unit.content) {
            Some(index) => *index,
            None => {
                let index = u16::try_from(palette.len())
                    .map_err(|_| BlueprintError::malformed(id, "palette exceeds u16 entries"))?;
                palette.push(&unit.content);
                palette_index.insert(&unit.content, index);
                index
            }
        };
        write_vec3(&mut units_payload, unit.position);
        units_payload.extend_from_slice(&index.to_le_bytes());
        if unit.extra_data.is_empty() {
            units_payload.push(0);
        } else {
            units_payload.push(UNIT_FLAG_EXTRA_DATA);
            write_compound(&mut units_payload, &unit.extra_data, id)?;
        }
    }

    let mut payload = Vec::<u8>::new();
    for content in &palette {
        write_string(&mut payload, &content.kind, id)?;
        let prop_count = u8::try_from(content.properties.len())
            .map_err(|_| BlueprintError::malformed(id, "too many properties on palette entry"))?;
        payload.push(prop_count);
        for (key, value) in &content.properties {
            write_string(&mut payload, key, id)?;
            write_string(&mut payload, value, id)?;
        }
    }
    payload.extend_from_slice(&units_payload);

    let palette_count = u16::try_from(palette.len())
        .map_err(|_| BlueprintError::malformed(id, "palette exceeds u16 entries"))?;
    let unit_count = u32::try_from(blueprint.units().len())
        .map_err(|_| BlueprintError::malformed(id, "unit count exceeds u32"))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| BlueprintError::malformed(id, "payload exceeds u32 bytes"))?;

    let mut bytes = Vec::<u8>::with_capacity(payload.len() + 64);
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&BLUEPRINT_FORMAT_VERSION.to_le_bytes());
    write_vec3(&mut bytes, blueprint.dimensions());
    bytes.extend_from_slice(&palette_count.to_le_bytes());
    bytes.extend_from_slice(&unit_count.to_le_bytes());
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(&sha256_bytes(&payload));
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Parses and validates a v1 blueprint. Never returns a partial result.
pub fn decode_blueprint(
    identifier: &BlueprintId,
    bytes: &[u8],
    limits: ValidationLimits,
) -> Result<Blueprint, BlueprintError> {
    let mut cursor = 0usize;

    let magic = read_exact(bytes, &mut cursor, 4, identifier)?;
    if magic != MAGIC {
        return Err(BlueprintError::malformed(identifier, "invalid magic"));
    }
    let version = read_u16(bytes, &mut cursor, identifier)?;
    if version != BLUEPRINT_FORMAT_VERSION {
        return Err(BlueprintError::malformed(
            identifier,
            format!("unsupported format version {version}"),
        ));
    }
    let dimensions = read_vec3(bytes, &mut cursor, identifier)?;
    let palette_count = read_u16(bytes, &mut cursor, identifier)? as usize;
    let unit_count = read_u32(bytes, &mut cursor, identifier)? as usize;
    let payload_len = read_u32(bytes, &mut cursor, identifier)? as usize;
    let expected_hash = read_exact(bytes, &mut cursor, 32, identifier)?;
    let payload = read_exact(bytes, &mut cursor, payload_len, identifier)?;
    if cursor != bytes.len() {
        return Err(BlueprintError::malformed(identifier, "unexpected trailing bytes"));
    }
    if expected_hash != sha256_bytes(payload) {
        return Err(BlueprintError::malformed(identifier, "payload hash mismatch"));
    }

    let mut cursor = 0usize;
    let mut palette = Vec::<ContentState>::with_capacity(palette_count);
    for _ in 0..palette_count {
        let kind = read_string(payload, &mut cursor, identifier)?;
        if kind.is_empty() {
            return Err(BlueprintError::malformed(identifier, "empty content kind in palette"));
        }
        let prop_count = read_u8(payload, &mut cursor, identifier)?;
        let mut content = ContentState::new(kind);
        for _ in 0..prop_count {
            let key = read_string(payload, &mut cursor, identifier)?;
            let value = read_string(payload, &mut cursor, identifier)?;
            content.properties.insert(key, value);
        }
        palette.push(content);
    }

    // Cap the reservation; a lying header must not drive a huge allocation.
    let mut units = Vec::<BlueprintUnit>::with_capacity(unit_count.min(payload.len() / 15 + 1));
    for _ in 0..unit_count {
        let position = read_vec3(payload, &mut cursor, identifier)?;
        let index = read_u16(payload, &mut cursor, identifier)? as usize;
        let content = palette.get(index).cloned().ok_or_else(|| {
            BlueprintError::malformed(
                identifier,
                format!("palette index {index} out of range ({palette_count} entries)"),
            )
        })?;
        let flags = read_u8(payload, &mut cursor, identifier)?;
        let extra_data = if flags & UNIT_FLAG_EXTRA_DATA != 0 {
            read_compound(payload, &mut cursor, identifier, 0)?
        } else {
            ExtraData::new()
        };
        units.push(BlueprintUnit {
            position,
            content,
            extra_data,
        });
    }
    if cursor != payload.len() {
        return Err(BlueprintError::malformed(identifier, "payload length mismatch"));
    }

    Blueprint::from_units(
        identifier.clone(),
        dimensions,
        units,
        to_hex_lower(&sha256_bytes(bytes)),
        limits,
    )
}

pub fn write_blueprint_file(path: &Path, blueprint: &Blueprint) -> Result<(), BlueprintError> {
    let bytes = encode_blueprint(blueprint)?;
    write_bytes_atomic(path, &bytes).map_err(|source| BlueprintError::Io {
        identifier: blueprint.id().clone(),
        path: path.to_path_buf(),
        source,
    })
}

fn write_vec3(target: &mut Vec<u8>, value: IntVec3) {
    target.extend_from_slice(&value.x.to_le_bytes());
    target.extend_from_slice(&value.y.to_le_bytes());
    target.extend_from_slice(&value.z.to_le_bytes());
}

fn write_string(target: &mut Vec<u8>, value: &str, id: &BlueprintId) -> Result<(), BlueprintError> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| BlueprintError::malformed(id, "string too long for u16 length"))?;
    target.extend_from_slice(&len.to_le_bytes());
    target.extend_from_slice(bytes);
    Ok(())
}

fn write_compound(
    target: &mut Vec<u8>,
    compound: &ExtraData,
    id: &BlueprintId,
) -> Result<(), BlueprintError> {
    let count = u16::try_from(compound.len())
        .map_err(|_| BlueprintError::malformed(id, "too many entries in compound tag"))?;
    target.extend_from_slice(&count.to_le_bytes());
    for (key, value) in compound {
        write_string(target, key, id)?;
        write_tag(target, value, id)?;
    }
    Ok(())
}

fn write_tag(target: &mut Vec<u8>, tag: &TagValue, id: &BlueprintId) -> Result<(), BlueprintError> {
    match tag {
        TagValue::Byte(value) => {
            target.push(TAG_BYTE);
            target.extend_from_slice(&value.to_le_bytes());
        }
        TagValue::Int(value) => {
            target.push(TAG_INT);
            target.extend_from_slice(&value.to_le_bytes());
        }
        TagValue::Long(value) => {
            target.push(TAG_LONG);
            target.extend_from_slice(&value.to_le_bytes());
        }
        TagValue::Float(value) => {
            target.push(TAG_FLOAT);
            target.extend_from_slice(&value.to_le_bytes());
        }
        TagValue::Double(value) => {
            target.push(TAG_DOUBLE);
            target.extend_from_slice(&value.to_le_bytes());
        }
        TagValue::String(value) => {
            target.push(TAG_STRING);
            write_string(target, value, id)?;
        }
        TagValue::List(items) => {
            target.push(TAG_LIST);
            let count = u32::try_from(items.len())
                .map_err(|_| BlueprintError::malformed(id, "list tag too long"))?;
            target.extend_from_slice(&count.to_le_bytes());
            for item in items {
                write_tag(target, item, id)?;
            }
        }
        TagValue::Compound(entries) => {
            target.push(TAG_COMPOUND);
            write_compound(target, entries, id)?;
        }
    }
    Ok(())
}

fn read_compound(
    bytes: &[u8],
    cursor: &mut usize,
    id: &BlueprintId,
    depth: usize,
) -> Result<ExtraData, BlueprintError> {
    let count = read_u16(bytes, cursor, id)?;
    let mut compound = ExtraData::new();
    for _ in 0..count {
        let key = read_string(bytes, cursor, id)?;
        let value = read_tag(bytes, cursor, id, depth + 1)?;
        if compound.insert(key.clone(), value).is_some() {
            return Err(BlueprintError::malformed(
                id,
                format!("duplicate key '{key}' in compound tag"),
            ));
        }
    }
    Ok(compound)
}

fn read_tag(
    bytes: &[u8],
    cursor: &mut usize,
    id: &BlueprintId,
    depth: usize,
) -> Result<TagValue, BlueprintError> {
    if depth > MAX_TAG_DEPTH {
        return Err(BlueprintError::malformed(id, "extra data nested too deeply"));
    }
    let tag = read_u8(bytes, cursor, id)?;
    Ok(match tag {
        TAG_BYTE => TagValue::Byte(i8::from_le_bytes(read_array(bytes, cursor, id)?)),
        TAG_INT => TagValue::Int(i32::from_le_bytes(read_array(bytes, cursor, id)?)),
        TAG_LONG => TagValue::Long(i64::from_le_bytes(read_array(bytes, cursor, id)?)),
        TAG_FLOAT => TagValue::Float(f32::from_le_bytes(read_array(bytes, cursor, id)?)),
        TAG_DOUBLE => TagValue::Double(f64::from_le_bytes(read_array(bytes, cursor, id)?)),
        TAG_STRING => TagValue::String(read_string(bytes, cursor, id)?),
        TAG_LIST => {
            let count = read_u32(bytes, cursor, id)? as usize;
            let mut items = Vec::<TagValue>::with_capacity(count.min(bytes.len()));
            for _ in 0..count {
                items.push(read_tag(bytes, cursor, id, depth + 1)?);
            }
            TagValue::List(items)
        }
        TAG_COMPOUND => TagValue::Compound(read_compound(bytes, cursor, id, depth)?),
        other => {
            return Err(BlueprintError::malformed(
                id,
                format!("unknown extra data tag {other}"),
            ))
        }
    })
}

fn read_vec3(bytes: &[u8], cursor: &mut usize, id: &BlueprintId) -> Result<IntVec3, BlueprintError> {
    let x = i32::from_le_bytes(read_array(bytes, cursor, id)?);
    let y = i32::from_le_bytes(read_array(bytes, cursor, id)?);
    let z = i32::from_le_bytes(read_array(bytes, cursor, id)?);
    Ok(IntVec3::new(x, y, z))
}

fn read_string(bytes: &[u8], cursor: &mut usize, id: &BlueprintId) -> Result<String, BlueprintError> {
    let len = read_u16(bytes, cursor, id)? as usize;
    let raw = read_exact(bytes, cursor, len, id)?;
    std::str::from_utf8(raw)
        .map(ToString::to_string)
        .map_err(|_| BlueprintError::malformed(id, "invalid UTF-8 string"))
}

fn read_u8(bytes: &[u8], cursor: &mut usize, id: &BlueprintId) -> Result<u8, BlueprintError> {
    Ok(u8::from_le_bytes(read_array(bytes, cursor, id)?))
}

fn read_u16(bytes: &[u8], cursor: &mut usize, id: &BlueprintId) -> Result<u16, BlueprintError> {
    Ok(u16::from_le_bytes(read_array(bytes, cursor, id)?))
}

fn read_u32(bytes: &[u8], cursor: &mut usize, id: &BlueprintId) -> Result<u32, BlueprintError> {
    Ok(u32::from_le_bytes(read_array(bytes, cursor, id)?))
}

fn read_array<const N: usize>(
    bytes: &[u8],
    cursor: &mut usize,
    id: &BlueprintId,
) -> Result<[u8; N], BlueprintError> {
    read_exact(bytes, cursor, N, id)?
        .try_into()
        .map_err(|_| BlueprintError::malformed(id, "invalid fixed-width encoding"))
}

fn read_exact<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
    id: &BlueprintId,
) -> Result<&'a [u8], BlueprintError> {
    let end = cursor.saturating_add(len);
    if end > bytes.len() {
        return Err(BlueprintError::malformed(id, "unexpected end of data"));
    }
    let out = &bytes[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn sha256_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn to_hex_lower(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut output, "{byte:02x}");
    }
    output
}
