use sb_core::{BridgeError, ScriptValue};
use sb_runtime::ScriptEngine;
use serde_json::{Map, Number, Value as Json};

const MAX_JSON_DEPTH: usize = 8;
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// JSON rendering of a script value for the result protocol. Functions and
/// anything nested too deeply render as their display string.
pub(crate) fn value_json(engine: &ScriptEngine, value: &ScriptValue) -> Result<Json, BridgeError> {
    value_json_at(engine, value, 0)
}

fn value_json_at(engine: &ScriptEngine, value: &ScriptValue, depth: usize) -> Result<Json, BridgeError> {
    if value.is_undefined() || value.is_null() {
        return Ok(Json::Null);
    }
    if let Some(flag) = value.as_bool() {
        return Ok(Json::Bool(flag));
    }
    if let Some(integer) = value.as_integer() {
        return Ok(Json::from(integer));
    }
    if let Some(number) = value.as_number() {
        return Ok(number_json(number));
    }
    if let Some(text) = value.as_str() {
        return Ok(Json::String(text.to_string()));
    }
    if !value.is_object() || engine.is_callable_value(value) || depth >= MAX_JSON_DEPTH {
        return Ok(Json::String(engine.to_display_string(value)));
    }
    if engine.value_type(value) == "Array" {
        let mut items = Vec::new();
        for entry in engine.new_iterator(value)? {
            let (_, item) = entry?;
            items.push(value_json_at(engine, &item, depth + 1)?);
        }
        return Ok(Json::Array(items));
    }
    let mut fields = Map::new();
    for entry in engine.new_iterator(value)? {
        let (name, item) = entry?;
        fields.insert(name, value_json_at(engine, &item, depth + 1)?);
    }
    Ok(Json::Object(fields))
}

fn number_json(number: f64) -> Json {
    if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER && !(number == 0.0 && number.is_sign_negative()) {
        return Json::Number(Number::from(number as i64));
    }
    Number::from_f64(number).map_or(Json::Null, Json::Number)
}

/// Converts a JSON config value into a script value owned by `engine`.
pub(crate) fn json_to_script(engine: &ScriptEngine, value: &Json) -> Result<ScriptValue, BridgeError> {
    match value {
        Json::Null => Ok(engine.null()),
        Json::Bool(flag) => Ok(engine.new_bool(*flag)),
        Json::Number(number) => Ok(match number.as_i64() {
            Some(integer) => engine.new_integer(integer),
            None => engine.new_number(number.as_f64().unwrap_or(f64::NAN)),
        }),
        Json::String(text) => Ok(engine.new_string(text)),
        Json::Array(items) => {
            let items = items
                .iter()
                .map(|item| json_to_script(engine, item))
                .collect::<Result<Vec<_>, _>>()?;
            engine.new_array(&items)
        }
        Json::Object(fields) => {
            let object = engine.new_object()?;
            for (name, field) in fields {
                engine.set_property(&object, name, &json_to_script(engine, field)?)?;
            }
            Ok(object)
        }
    }
}

pub(crate) fn emit_success(engine: &ScriptEngine, prints: &[String], value: &ScriptValue) -> Result<i32, BridgeError> {
    let rendered = value_json(engine, value)?;
    println!("RESULT:OK");
    for line in prints {
        println!("PRINT_JSON:{}", Json::String(line.clone()));
    }
    println!("TYPE:{}", engine.value_type(value));
    println!("VALUE_JSON:{rendered}");
    Ok(0)
}
