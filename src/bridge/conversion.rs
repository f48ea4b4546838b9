//! Conversion between host values and embedded objects.
//!
//! Both directions are total: a node that cannot be converted structurally
//! becomes a foreign handle (towards the host) or a string stand-in (towards
//! the embedded runtime), and conversion continues with its siblings.

use super::context::ContextTag;
use super::host_value::{HostArray, HostObject, HostValue};
use super::registry::BridgeState;
use pyo3::prelude::*;
use pyo3::types::{
    PyBool, PyBytes, PyDict, PyFloat, PyFrozenSet, PyInt, PyList, PySet, PyString, PyTuple,
};
use std::collections::HashMap;
use tracing::trace;

/// Stand-in passed to the embedded side for a handle that no longer resolves.
pub(crate) const RECYCLED_PLACEHOLDER: &str = "RuntimeError('object has been recycled')";
const DEPTH_PLACEHOLDER: &str = "RuntimeError('maximum conversion depth exceeded')";

/// Largest magnitude at which every integer is exactly representable in an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Marshals values for one context.
pub(crate) struct Marshaler<'a> {
    state: &'a BridgeState,
    tag: &'a ContextTag,
    max_depth: usize,
}

impl<'a> Marshaler<'a> {
    pub(crate) fn new(state: &'a BridgeState, tag: &'a ContextTag, max_depth: usize) -> Self {
        Self {
            state,
            tag,
            max_depth,
        }
    }

    /// Convert a host value into an embedded object.
    pub(crate) fn to_foreign<'py>(&self, py: Python<'py>, value: &HostValue) -> Bound<'py, PyAny> {
        let mut memo = HashMap::new();
        self.foreign_node(py, value, &mut memo, 0)
    }

    /// Convert positional arguments into a tuple. One memo covers every argument,
    /// so a value passed twice arrives as the same object.
    pub(crate) fn args_to_foreign<'py>(
        &self,
        py: Python<'py>,
        args: &[HostValue],
    ) -> PyResult<Bound<'py, PyTuple>> {
        let mut memo = HashMap::new();
        let items: Vec<Bound<'py, PyAny>> = args
            .iter()
            .map(|arg| self.foreign_node(py, arg, &mut memo, 0))
            .collect();
        PyTuple::new(py, items)
    }

    /// Convert a host object into an embedded dict (used for keyword arguments).
    pub(crate) fn object_to_foreign<'py>(
        &self,
        py: Python<'py>,
        object: &HostObject,
    ) -> PyResult<Bound<'py, PyDict>> {
        let mut memo = HashMap::new();
        self.foreign_dict(py, object, &mut memo, 0)
    }

    /// Convert an embedded object into a host value.
    pub(crate) fn to_host(&self, py: Python<'_>, object: &Bound<'_, PyAny>) -> HostValue {
        let mut memo = HashMap::new();
        self.host_node(py, object, &mut memo, 0)
    }

    fn foreign_node<'py>(
        &self,
        py: Python<'py>,
        value: &HostValue,
        memo: &mut HashMap<usize, Bound<'py, PyAny>>,
        depth: usize,
    ) -> Bound<'py, PyAny> {
        if depth > self.max_depth {
            return PyString::new(py, DEPTH_PLACEHOLDER).into_any();
        }
        match self.try_foreign_node(py, value, memo, depth) {
            Ok(object) => object,
            Err(err) => {
                trace!(error = %err, kind = value.kind(), "host value degraded to text");
                PyString::new(py, &format!("RuntimeError({:?})", err.to_string())).into_any()
            }
        }
    }

    fn try_foreign_node<'py>(
        &self,
        py: Python<'py>,
        value: &HostValue,
        memo: &mut HashMap<usize, Bound<'py, PyAny>>,
        depth: usize,
    ) -> PyResult<Bound<'py, PyAny>> {
        let object = match value {
            HostValue::Undefined | HostValue::Null => py.None().into_bound(py),
            HostValue::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
            HostValue::Number(n) => number_to_foreign(py, *n)?,
            HostValue::String(s) => PyString::new(py, s).into_any(),
            HostValue::Buffer(bytes) => PyBytes::new(py, bytes).into_any(),
            HostValue::Array(array) => self.foreign_list(py, array, memo, depth)?,
            HostValue::Object(object) => self.foreign_dict(py, object, memo, depth)?.into_any(),
            HostValue::Handle(handle) => match self.state.resolve(py, handle) {
                Ok(object) => object,
                Err(_) => PyString::new(py, RECYCLED_PLACEHOLDER).into_any(),
            },
            other => PyString::new(py, &other.display_text()).into_any(),
        };
        Ok(object)
    }

    fn foreign_list<'py>(
        &self,
        py: Python<'py>,
        array: &HostArray,
        memo: &mut HashMap<usize, Bound<'py, PyAny>>,
        depth: usize,
    ) -> PyResult<Bound<'py, PyAny>> {
        if let Some(existing) = memo.get(&array.identity()) {
            return Ok(existing.clone());
        }
        let list = PyList::empty(py);
        memo.insert(array.identity(), list.clone().into_any());
        for item in array.to_vec() {
            list.append(self.foreign_node(py, &item, memo, depth + 1))?;
        }
        Ok(list.into_any())
    }

    fn foreign_dict<'py>(
        &self,
        py: Python<'py>,
        object: &HostObject,
        memo: &mut HashMap<usize, Bound<'py, PyAny>>,
        depth: usize,
    ) -> PyResult<Bound<'py, PyDict>> {
        if let Some(existing) = memo.get(&object.identity()) {
            if let Ok(dict) = existing.clone().cast_into::<PyDict>() {
                return Ok(dict);
            }
        }
        let dict = PyDict::new(py);
        memo.insert(object.identity(), dict.clone().into_any());
        for (key, value) in object.entries() {
            dict.set_item(key, self.foreign_node(py, &value, memo, depth + 1))?;
        }
        Ok(dict)
    }

    fn host_node(
        &self,
        py: Python<'_>,
        object: &Bound<'_, PyAny>,
        memo: &mut HashMap<usize, HostValue>,
        depth: usize,
    ) -> HostValue {
        if depth > self.max_depth {
            return self.handle(py, object);
        }
        match self.try_host_node(py, object, memo, depth) {
            Ok(Some(value)) => value,
            Ok(None) => self.handle(py, object),
            Err(err) => {
                trace!(error = %err, "embedded value kept as handle");
                self.handle(py, object)
            }
        }
    }

    /// `Ok(None)` means the object has no structural host form.
    fn try_host_node(
        &self,
        py: Python<'_>,
        object: &Bound<'_, PyAny>,
        memo: &mut HashMap<usize, HostValue>,
        depth: usize,
    ) -> PyResult<Option<HostValue>> {
        if object.is_none() {
            return Ok(Some(HostValue::Null));
        }
        // bool before int: bool is an int subclass.
        if let Ok(b) = object.cast::<PyBool>() {
            return Ok(Some(HostValue::Bool(b.is_true())));
        }
        if object.is_instance_of::<PyInt>() || object.is_instance_of::<PyFloat>() {
            return Ok(Some(HostValue::Number(object.extract::<f64>()?)));
        }
        if let Ok(s) = object.cast::<PyString>() {
            return Ok(Some(HostValue::String(s.to_str()?.to_owned())));
        }
        if let Ok(bytes) = object.cast::<PyBytes>() {
            return Ok(Some(HostValue::Buffer(bytes.as_bytes().to_vec())));
        }
        if let Ok(tuple) = object.cast::<PyTuple>() {
            let items = tuple
                .iter()
                .map(|item| self.host_node(py, &item, memo, depth + 1))
                .collect();
            return Ok(Some(HostValue::Array(HostArray::from_vec(items))));
        }
        if let Ok(list) = object.cast::<PyList>() {
            let id = list.as_ptr() as usize;
            if let Some(existing) = memo.get(&id) {
                return Ok(Some(existing.clone()));
            }
            let array = HostArray::new();
            memo.insert(id, HostValue::Array(array.clone()));
            for item in list.iter() {
                array.push(self.host_node(py, &item, memo, depth + 1));
            }
            return Ok(Some(HostValue::Array(array)));
        }
        if let Ok(dict) = object.cast::<PyDict>() {
            return Ok(Some(self.host_dict(py, dict, memo, depth)?));
        }
        if object.is_instance_of::<PySet>() || object.is_instance_of::<PyFrozenSet>() {
            let array = HostArray::new();
            for item in object.try_iter()? {
                array.push(self.host_node(py, &item?, memo, depth + 1));
            }
            return Ok(Some(HostValue::Array(array)));
        }
        Ok(None)
    }

    fn host_dict(
        &self,
        py: Python<'_>,
        dict: &Bound<'_, PyDict>,
        memo: &mut HashMap<usize, HostValue>,
        depth: usize,
    ) -> PyResult<HostValue> {
        let id = dict.as_ptr() as usize;
        if let Some(existing) = memo.get(&id) {
            return Ok(existing.clone());
        }

        // Snapshot first: converting values can run embedded code that mutates the dict.
        let items = dict.items();
        let mut entries = Vec::with_capacity(items.len());
        for item in items.iter() {
            let (key, value) = item.extract::<(Bound<'_, PyAny>, Bound<'_, PyAny>)>()?;
            match key.cast::<PyString>() {
                Ok(key) => entries.push((key.to_str()?.to_owned(), value)),
                Err(_) => {
                    let handle = HostValue::Handle(self.state.acquire(py, dict.as_any(), self.tag));
                    memo.insert(id, handle.clone());
                    return Ok(handle);
                }
            }
        }

        let object = HostObject::new();
        memo.insert(id, HostValue::Object(object.clone()));
        for (key, value) in entries {
            object.insert(key, self.host_node(py, &value, memo, depth + 1));
        }
        Ok(HostValue::Object(object))
    }

    fn handle(&self, py: Python<'_>, object: &Bound<'_, PyAny>) -> HostValue {
        HostValue::Handle(self.state.acquire(py, object, self.tag))
    }
}

fn number_to_foreign<'py>(py: Python<'py>, n: f64) -> PyResult<Bound<'py, PyAny>> {
    if !n.is_finite() || n.fract() != 0.0 {
        return Ok(PyFloat::new(py, n).into_any());
    }
    if n.abs() <= MAX_SAFE_INTEGER {
        return Ok(PyInt::new(py, n as i64).into_any());
    }
    // Integral but past the exact range: let the embedded runtime widen it.
    py.get_type::<PyInt>().call1((n,))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::start_runtime;

    fn with_marshaler<R>(work: impl FnOnce(Python<'_>, &Marshaler<'_>) -> R) -> R {
        start_runtime();
        let state = BridgeState::new();
        let tag = ContextTag::Main;
        let marshaler = Marshaler::new(&state, &tag, 16);
        Python::attach(|py| work(py, &marshaler))
    }

    #[test]
    fn test_arguments_share_identity() {
        with_marshaler(|py, marshaler| {
            let shared = HostValue::array([HostValue::Number(1.0)]);
            let nested = HostValue::object([("inner", shared.clone())]);
            let args = marshaler
                .args_to_foreign(py, &[shared.clone(), shared, nested])
                .expect("args");

            let first = args.get_item(0).expect("first");
            let second = args.get_item(1).expect("second");
            let inner = args
                .get_item(2)
                .expect("third")
                .get_item("inner")
                .expect("inner");
            assert_eq!(first.as_ptr(), second.as_ptr());
            assert_eq!(first.as_ptr(), inner.as_ptr());
        });
    }

    #[test]
    fn test_primitive_round_trip() {
        with_marshaler(|py, marshaler| {
            let samples = [
                HostValue::Bool(true),
                HostValue::Bool(false),
                HostValue::Number(42.0),
                HostValue::Number(-7.0),
                HostValue::Number(2.5),
                HostValue::from("héllo"),
                HostValue::Buffer(vec![0, 1, 254, 255]),
                HostValue::Null,
            ];
            for sample in samples {
                let object = marshaler.to_foreign(py, &sample);
                assert_eq!(marshaler.to_host(py, &object), sample);
            }
        });
    }

    #[test]
    fn test_integral_numbers_become_ints() {
        with_marshaler(|py, marshaler| {
            let int = marshaler.to_foreign(py, &HostValue::Number(3.0));
            assert!(int.is_exact_instance_of::<PyInt>());

            let float = marshaler.to_foreign(py, &HostValue::Number(3.5));
            assert!(float.is_exact_instance_of::<PyFloat>());

            let big = marshaler.to_foreign(py, &HostValue::Number(1e20));
            assert!(big.is_exact_instance_of::<PyInt>());
            assert_eq!(big.str().expect("str").to_str().expect("utf8"), "100000000000000000000");

            let nan = marshaler.to_foreign(py, &HostValue::Number(f64::NAN));
            assert!(nan.is_exact_instance_of::<PyFloat>());
        });
    }

    #[test]
    fn test_undefined_becomes_none() {
        with_marshaler(|py, marshaler| {
            assert!(marshaler.to_foreign(py, &HostValue::Undefined).is_none());
        });
    }

    #[test]
    fn test_host_cycle_becomes_self_referencing_list() {
        with_marshaler(|py, marshaler| {
            let array = HostArray::new();
            array.push(HostValue::Number(1.0));
            array.push(HostValue::Array(array.clone()));

            let object = marshaler.to_foreign(py, &HostValue::Array(array));
            let list = object.cast::<PyList>().expect("list");
            let inner = list.get_item(1).expect("second item");
            assert_eq!(inner.as_ptr(), object.as_ptr());
        });
    }

    #[test]
    fn test_embedded_cycle_becomes_self_referencing_array() {
        with_marshaler(|py, marshaler| {
            let list = PyList::new(py, [1]).expect("list");
            list.append(&list).expect("append self");

            let value = marshaler.to_host(py, list.as_any());
            let array = value.as_array().expect("array").clone();
            assert_eq!(array.len(), 2);
            let inner = array.get(1).expect("second item");
            assert!(inner.as_array().expect("nested array").ptr_eq(&array));

            // Break the embedded cycle so the list can be collected.
            list.del_item(1).expect("del");
        });
    }

    #[test]
    fn test_embedded_dict_cycle_is_shared() {
        with_marshaler(|py, marshaler| {
            let dict = PyDict::new(py);
            dict.set_item("me", &dict).expect("set self");

            let value = marshaler.to_host(py, dict.as_any());
            let object = value.as_object().expect("object").clone();
            let me = object.get("me").expect("me");
            assert!(me.as_object().expect("nested object").ptr_eq(&object));

            dict.clear();
        });
    }

    #[test]
    fn test_non_string_keys_yield_handle() {
        start_runtime();
        let state = BridgeState::new();
        let tag = ContextTag::Main;
        let marshaler = Marshaler::new(&state, &tag, 16);
        Python::attach(|py| {
            let dict = PyDict::new(py);
            dict.set_item(1, "a").expect("set");

            let value = marshaler.to_host(py, dict.as_any());
            let handle = value.as_handle().expect("handle").clone();
            assert_eq!(handle.type_name(), "dict");
            assert_eq!(handle.display_text(), Some("{1: 'a'}"));
            assert!(state.release(py, &handle));
        });
    }

    #[test]
    fn test_tuples_and_sets_become_arrays() {
        with_marshaler(|py, marshaler| {
            let tuple = PyTuple::new(py, [1, 2]).expect("tuple");
            assert_eq!(
                marshaler.to_host(py, tuple.as_any()),
                HostValue::array([HostValue::Number(1.0), HostValue::Number(2.0)])
            );

            let set = PySet::new(py, [5]).expect("set");
            assert_eq!(
                marshaler.to_host(py, set.as_any()),
                HostValue::array([HostValue::Number(5.0)])
            );
        });
    }

    #[test]
    fn test_unsupported_values_become_handles() {
        start_runtime();
        let state = BridgeState::new();
        let tag = ContextTag::Main;
        let marshaler = Marshaler::new(&state, &tag, 16);
        Python::attach(|py| {
            let huge = py
                .eval(c"10 ** 400", None, None)
                .expect("huge int");
            let value = marshaler.to_host(py, &huge);
            let handle = value.as_handle().expect("overflowing int stays foreign").clone();
            assert_eq!(handle.type_name(), "int");

            let module = py.import("math").expect("math").into_any();
            let value = marshaler.to_host(py, &module);
            let module_handle = value.as_handle().expect("module handle").clone();
            assert_eq!(module_handle.type_name(), "module");

            assert!(state.release(py, &handle));
            assert!(state.release(py, &module_handle));
        });
    }

    #[test]
    fn test_recycled_handle_degrades_to_placeholder() {
        start_runtime();
        let state = BridgeState::new();
        let tag = ContextTag::Main;
        let marshaler = Marshaler::new(&state, &tag, 16);
        Python::attach(|py| {
            let list = PyList::empty(py).into_any();
            let handle = state.acquire(py, &list, &tag);
            let resolved = marshaler.to_foreign(py, &HostValue::Handle(handle.clone()));
            assert_eq!(resolved.as_ptr(), list.as_ptr());

            assert!(state.release(py, &handle));
            let args = HostValue::array([HostValue::Number(1.0), HostValue::Handle(handle)]);
            let object = marshaler.to_foreign(py, &args);
            let placeholder = object
                .cast::<PyList>()
                .expect("list")
                .get_item(1)
                .expect("item");
            assert_eq!(
                placeholder.extract::<String>().expect("string"),
                RECYCLED_PLACEHOLDER
            );
        });
    }

    #[test]
    fn test_depth_limit_degrades_without_failing() {
        start_runtime();
        let state = BridgeState::new();
        let tag = ContextTag::Main;
        let marshaler = Marshaler::new(&state, &tag, 2);
        Python::attach(|py| {
            let deep = HostValue::array([HostValue::array([HostValue::array([
                HostValue::array([HostValue::Number(1.0)]),
            ])])]);
            let object = marshaler.to_foreign(py, &deep);
            let rendered = object.repr().expect("repr").to_string();
            assert!(rendered.contains("maximum conversion depth exceeded"), "{rendered}");
        });
    }
}
