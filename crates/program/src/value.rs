//! Cross-boundary value conversion
//!
//! Values crossing the trust boundary are structured-cloned through
//! `serde_json::Value`: guest objects never leak live references to the host
//! and host data enters the guest as fresh objects of the guest realm.
//! Error objects clone to `{name, message, stack}` so a thrown `Error` stays
//! recognizable; any other thrown value round-trips verbatim.

use rquickjs::{Array, Ctx, Exception, Object, Value};
use serde_json::Value as Json;

/// Conversion depth cap. JSON cloning cannot represent cycles, so deeply
/// nested (or cyclic) guest values fail the clone instead of overflowing
/// the stack.
pub(crate) const MAX_CLONE_DEPTH: usize = 64;

/// Build a guest value from JSON data.
pub(crate) fn json_to_js<'js>(ctx: &Ctx<'js>, value: &Json) -> rquickjs::Result<Value<'js>> {
    match value {
        Json::Null => Ok(Value::new_null(ctx.clone())),
        Json::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(i) = i32::try_from(i) {
                    return Ok(Value::new_int(ctx.clone(), i));
                }
                return Ok(Value::new_float(ctx.clone(), i as f64));
            }
            Ok(Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)))
        }
        Json::String(s) => Ok(rquickjs::String::from_str(ctx.clone(), s)?.into_value()),
        Json::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(arr.into_value())
        }
        Json::Object(map) => {
            let obj = Object::new(ctx.clone())?;
            for (k, v) in map {
                obj.set(k.as_str(), json_to_js(ctx, v)?)?;
            }
            Ok(obj.into_value())
        }
    }
}

/// Structured-clone a guest value into JSON data.
///
/// Functions and symbols clone to null. Exceeding the depth cap throws a
/// guest-side clone error so the failing call reports it.
pub(crate) fn js_to_json(ctx: &Ctx<'_>, value: &Value<'_>) -> rquickjs::Result<Json> {
    js_to_json_depth(ctx, value, 0)
}

fn js_to_json_depth(ctx: &Ctx<'_>, value: &Value<'_>, depth: usize) -> rquickjs::Result<Json> {
    if depth > MAX_CLONE_DEPTH {
        return Err(Exception::throw_message(
            ctx,
            "value is too deeply nested to copy across the sandbox boundary",
        ));
    }
    if value.is_null() || value.is_undefined() {
        return Ok(Json::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(Json::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(Json::from(i));
    }
    if let Some(f) = value.as_float() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Ok(Json::Number(n));
        }
        return Ok(Json::Null);
    }
    if let Some(s) = value.as_string() {
        return Ok(Json::String(s.to_string()?));
    }
    if value.is_error() {
        if let Some(obj) = value.as_object() {
            return Ok(error_object_to_json(obj));
        }
    }
    if let Some(arr) = value.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for i in 0..arr.len() {
            match arr.get::<Value>(i) {
                Ok(v) => out.push(js_to_json_depth(ctx, &v, depth + 1)?),
                Err(_) => out.push(Json::Null),
            }
        }
        return Ok(Json::Array(out));
    }
    if let Some(obj) = value.as_object() {
        if obj.as_function().is_some() {
            return Ok(Json::Null);
        }
        let mut out = serde_json::Map::new();
        for item in obj.props::<String, Value>() {
            let (k, v) = item?;
            out.insert(k, js_to_json_depth(ctx, &v, depth + 1)?);
        }
        return Ok(Json::Object(out));
    }
    // Symbols, big ints and other exotica do not survive the clone.
    Ok(Json::Null)
}

/// Clone an `Error` instance to `{name, message, stack}`. Error properties
/// are non-enumerable, so the generic object walk would lose them.
fn error_object_to_json(obj: &Object<'_>) -> Json {
    let mut out = serde_json::Map::new();
    for key in ["name", "message", "stack"] {
        if let Ok(v) = obj.get::<_, Option<String>>(key) {
            if let Some(v) = v {
                out.insert(key.to_string(), Json::String(v));
            }
        }
    }
    Json::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx(f: impl FnOnce(Ctx<'_>)) {
        let rt = Runtime::new().unwrap();
        let ctx = Context::full(&rt).unwrap();
        ctx.with(f);
    }

    #[test]
    fn json_round_trips_through_guest() {
        with_ctx(|ctx| {
            let input = json!({
                "n": 41,
                "f": 1.5,
                "s": "hi",
                "b": true,
                "null": null,
                "arr": [1, [2, 3], {"k": "v"}],
            });
            let js = json_to_js(&ctx, &input).unwrap();
            let back = js_to_json(&ctx, &js).unwrap();
            assert_eq!(back, input);
        });
    }

    #[test]
    fn numbers_beyond_i32_become_floats() {
        with_ctx(|ctx| {
            let input = json!(9007199254740991i64);
            let js = json_to_js(&ctx, &input).unwrap();
            let back = js_to_json(&ctx, &js).unwrap();
            assert_eq!(back.as_f64(), Some(9007199254740991.0));
        });
    }

    #[test]
    fn guest_error_clones_name_and_message() {
        with_ctx(|ctx| {
            let v: Value = ctx.eval("new TypeError('nope')").unwrap();
            let json = js_to_json(&ctx, &v).unwrap();
            assert_eq!(json["name"], json!("TypeError"));
            assert_eq!(json["message"], json!("nope"));
        });
    }

    #[test]
    fn functions_clone_to_null() {
        with_ctx(|ctx| {
            let v: Value = ctx.eval("(function f() {})").unwrap();
            assert_eq!(js_to_json(&ctx, &v).unwrap(), Json::Null);
        });
    }

    #[test]
    fn cyclic_value_fails_instead_of_overflowing() {
        with_ctx(|ctx| {
            let v: Value = ctx.eval("const a = {}; a.self = a; a").unwrap();
            assert!(js_to_json(&ctx, &v).is_err());
        });
    }

    #[test]
    fn non_finite_numbers_clone_to_null() {
        with_ctx(|ctx| {
            let v: Value = ctx.eval("0/0").unwrap();
            assert_eq!(js_to_json(&ctx, &v).unwrap(), Json::Null);
        });
    }
}
