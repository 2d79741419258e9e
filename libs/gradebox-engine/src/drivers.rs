//! Per-language driver generation.
//!
//! A driver is a small harness program compiled or loaded next to the
//! submitted source. It locates the entry point, reads one canonical
//! argument per line from stdin, calls the entry point and prints the return
//! value on a line starting with [`RESULT_MARKER`]. Anything else the
//! submission prints is ignored.
//!
//! In probe mode (`--probe`) interpreted drivers only check that the entry
//! point exists and exit with [`ENTRY_POINT_MISSING_EXIT`] when it does not.

use gradebox_common::types::{EntryPoint, Language, ValueType};

pub const RESULT_MARKER: &str = "@@gradebox-result@@";
pub const PROBE_FLAG: &str = "--probe";
pub const ENTRY_POINT_MISSING_EXIT: i64 = 3;

/// Language-specific half of the loader: knows how to wrap a submission.
pub trait Toolchain: Send + Sync {
    fn language(&self) -> Language;

    /// Source of the driver program for `entry`, which loads the submission
    /// from `source_file` in the same directory.
    fn render_driver(&self, entry: &EntryPoint, source_file: &str) -> String;
}

pub struct PythonToolchain;
pub struct JavascriptToolchain;
pub struct CppToolchain;
pub struct JavaToolchain;

pub fn toolchain_for(language: Language) -> &'static dyn Toolchain {
    match language {
        Language::Python => &PythonToolchain,
        Language::Javascript => &JavascriptToolchain,
        Language::Cpp => &CppToolchain,
        Language::Java => &JavaToolchain,
    }
}

const PYTHON_DRIVER: &str = r#"import importlib.util
import inspect
import json
import os
import sys

ENTRY = "__ENTRY__"
ARITY = __ARITY__
MARKER = "__MARKER__"


def _load():
    path = os.path.join(os.path.dirname(os.path.abspath(__file__)), "__SOURCE__")
    spec = importlib.util.spec_from_file_location("solution", path)
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    return module


def _resolve(module):
    fn = getattr(module, ENTRY, None)
    if callable(fn) and not isinstance(fn, type):
        return fn
    cls = getattr(module, "Solution", None)
    if isinstance(cls, type) and callable(getattr(cls, ENTRY, None)):
        return getattr(cls(), ENTRY)
    return None


def _accepts_arity(fn):
    try:
        params = list(inspect.signature(fn).parameters.values())
    except (TypeError, ValueError):
        return True
    if any(p.kind == p.VAR_POSITIONAL for p in params):
        return True
    positional = [p for p in params if p.kind in (p.POSITIONAL_ONLY, p.POSITIONAL_OR_KEYWORD)]
    required = [p for p in positional if p.default is p.empty]
    return len(required) <= ARITY <= len(positional)


def main():
    entry = _resolve(_load())
    if entry is None:
        sys.stderr.write("Entry point '%s' not found\n" % ENTRY)
        sys.exit(3)
    if not _accepts_arity(entry):
        sys.stderr.write("Entry point '%s' must accept %d argument(s)\n" % (ENTRY, ARITY))
        sys.exit(3)
    if "__PROBE__" in sys.argv[1:]:
        return
    args = [json.loads(line) for line in sys.stdin.read().splitlines() if line.strip()]
    try:
        result = entry(*args)
    except Exception as exc:
        sys.stdout.flush()
        sys.stderr.write("%s: %s\n" % (type(exc).__name__, exc))
        sys.exit(1)
    sys.stdout.write("\n%s%s\n" % (MARKER, json.dumps(result)))


main()
"#;

impl Toolchain for PythonToolchain {
    fn language(&self) -> Language {
        Language::Python
    }

    fn render_driver(&self, entry: &EntryPoint, source_file: &str) -> String {
        PYTHON_DRIVER
            .replace("__ENTRY__", &entry.name)
            .replace("__ARITY__", &entry.params.len().to_string())
            .replace("__MARKER__", RESULT_MARKER)
            .replace("__SOURCE__", source_file)
            .replace("__PROBE__", PROBE_FLAG)
    }
}

const JAVASCRIPT_DRIVER: &str = r#""use strict";
const fs = require("fs");
const path = require("path");

const ENTRY = "__ENTRY__";
const MARKER = "__MARKER__";

function load() {
  const source = fs.readFileSync(path.join(__dirname, "__SOURCE__"), "utf8");
  const module = { exports: {} };
  const factory = new Function(
    "module",
    "exports",
    "require",
    source +
      "\n;return { direct: typeof __ENTRY__ === 'function' ? __ENTRY__ : undefined," +
      " cls: typeof Solution === 'function' ? Solution : undefined };"
  );
  const found = factory(module, module.exports, require);
  if (typeof found.direct === "function") {
    return found.direct;
  }
  if (found.cls && typeof found.cls.prototype[ENTRY] === "function") {
    const instance = new found.cls();
    return instance[ENTRY].bind(instance);
  }
  const exported = module.exports;
  if (exported && typeof exported[ENTRY] === "function") {
    return exported[ENTRY].bind(exported);
  }
  return null;
}

// JSON.parse rounds integers beyond 2^53 without complaint.
function parseArgument(line) {
  const value = JSON.parse(line);
  const items = Array.isArray(value) ? value : [value];
  for (const item of items) {
    if (!Number.isSafeInteger(item)) {
      throw new RangeError("argument out of safe integer range: " + line.trim());
    }
  }
  return value;
}

function main() {
  const entry = load();
  if (!entry) {
    process.stderr.write("Entry point '" + ENTRY + "' not found\n");
    process.exit(3);
  }
  if (process.argv.slice(2).includes("__PROBE__")) {
    return;
  }
  let result;
  try {
    const args = fs
      .readFileSync(0, "utf8")
      .split(/\r?\n/)
      .filter((line) => line.trim() !== "")
      .map(parseArgument);
    result = entry(...args);
  } catch (err) {
    const message = err instanceof Error ? err.name + ": " + err.message : String(err);
    process.stderr.write(message + "\n");
    process.exit(1);
  }
  process.stdout.write("\n" + MARKER + JSON.stringify(result) + "\n");
}

main();
"#;

impl Toolchain for JavascriptToolchain {
    fn language(&self) -> Language {
        Language::Javascript
    }

    fn render_driver(&self, entry: &EntryPoint, source_file: &str) -> String {
        JAVASCRIPT_DRIVER
            .replace("__ENTRY__", &entry.name)
            .replace("__MARKER__", RESULT_MARKER)
            .replace("__SOURCE__", source_file)
            .replace("__PROBE__", PROBE_FLAG)
    }
}

const CPP_DRIVER: &str = r#"#include <bits/stdc++.h>
using namespace std;

#include "__SOURCE__"

namespace gradebox_driver {

static const char* MARKER = "__MARKER__";

static int parse_int(const string& token) {
    try {
        return stoi(token);
    } catch (const out_of_range&) {
        throw out_of_range("argument out of int range: " + token);
    }
}

static vector<int> parse_int_array(const string& line) {
    vector<int> values;
    size_t open = line.find('[');
    size_t close = line.rfind(']');
    if (open == string::npos || close == string::npos || close < open) {
        throw invalid_argument("malformed list argument");
    }
    stringstream body(line.substr(open + 1, close - open - 1));
    string token;
    while (getline(body, token, ',')) {
        if (token.find_first_not_of(" \t") == string::npos) {
            continue;
        }
        values.push_back(parse_int(token));
    }
    return values;
}

static string render(int value) {
    return to_string(value);
}

static string render(const vector<int>& values) {
    string out = "[";
    for (size_t i = 0; i < values.size(); ++i) {
        if (i > 0) {
            out += ", ";
        }
        out += to_string(values[i]);
    }
    return out + "]";
}

}  // namespace gradebox_driver

int main() {
    vector<string> lines;
    string line;
    while (getline(cin, line)) {
        if (line.find_first_not_of(" \t\r") != string::npos) {
            lines.push_back(line);
        }
    }
    try {
__ARGS__
        Solution solution;
        __RETURN__ result = solution.__ENTRY__(__CALL__);
        cout << "\n" << gradebox_driver::MARKER << gradebox_driver::render(result) << endl;
    } catch (const exception& e) {
        cout.flush();
        cerr << e.what() << endl;
        return 1;
    }
    return 0;
}
"#;

impl CppToolchain {
    fn type_name(ty: ValueType) -> &'static str {
        match ty {
            ValueType::Int => "int",
            ValueType::IntArray => "vector<int>",
        }
    }

    fn argument_decl(index: usize, ty: ValueType) -> String {
        match ty {
            ValueType::Int => format!(
                "        int arg{0} = gradebox_driver::parse_int(lines.at({0}));",
                index
            ),
            ValueType::IntArray => format!(
                "        vector<int> arg{0} = gradebox_driver::parse_int_array(lines.at({0}));",
                index
            ),
        }
    }
}

impl Toolchain for CppToolchain {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn render_driver(&self, entry: &EntryPoint, source_file: &str) -> String {
        let args: Vec<String> = entry
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| Self::argument_decl(i, *ty))
            .collect();
        CPP_DRIVER
            .replace("__ARGS__", &args.join("\n"))
            .replace("__RETURN__", Self::type_name(entry.returns))
            .replace("__CALL__", &call_list(entry.params.len()))
            .replace("__ENTRY__", &entry.name)
            .replace("__MARKER__", RESULT_MARKER)
            .replace("__SOURCE__", source_file)
    }
}

const JAVA_DRIVER: &str = r#"import java.io.BufferedReader;
import java.io.InputStreamReader;
import java.util.ArrayList;
import java.util.Arrays;
import java.util.List;

public class Main {
    private static final String MARKER = "__MARKER__";

    private static int[] parseIntArray(String line) {
        String body = line.trim();
        int open = body.indexOf('[');
        int close = body.lastIndexOf(']');
        if (open < 0 || close < open) {
            throw new IllegalArgumentException("malformed list argument");
        }
        body = body.substring(open + 1, close).trim();
        if (body.isEmpty()) {
            return new int[0];
        }
        String[] parts = body.split(",");
        int[] values = new int[parts.length];
        for (int i = 0; i < parts.length; i++) {
            values[i] = Integer.parseInt(parts[i].trim());
        }
        return values;
    }

    private static String render(int value) {
        return Integer.toString(value);
    }

    private static String render(int[] values) {
        return Arrays.toString(values);
    }

    public static void main(String[] args) throws Exception {
        BufferedReader reader = new BufferedReader(new InputStreamReader(System.in));
        List<String> lines = new ArrayList<>();
        String line;
        while ((line = reader.readLine()) != null) {
            if (!line.trim().isEmpty()) {
                lines.add(line);
            }
        }
        try {
__ARGS__
            __RETURN__ result = new Solution().__ENTRY__(__CALL__);
            System.out.println();
            System.out.println(MARKER + render(result));
        } catch (Throwable t) {
            System.out.flush();
            System.err.println(t);
            System.exit(1);
        }
    }
}
"#;

impl JavaToolchain {
    fn type_name(ty: ValueType) -> &'static str {
        match ty {
            ValueType::Int => "int",
            ValueType::IntArray => "int[]",
        }
    }

    fn argument_decl(index: usize, ty: ValueType) -> String {
        match ty {
            ValueType::Int => format!(
                "            int arg{0} = Integer.parseInt(lines.get({0}).trim());",
                index
            ),
            ValueType::IntArray => format!(
                "            int[] arg{0} = parseIntArray(lines.get({0}));",
                index
            ),
        }
    }
}

impl Toolchain for JavaToolchain {
    fn language(&self) -> Language {
        Language::Java
    }

    fn render_driver(&self, entry: &EntryPoint, _source_file: &str) -> String {
        let args: Vec<String> = entry
            .params
            .iter()
            .enumerate()
            .map(|(i, ty)| Self::argument_decl(i, *ty))
            .collect();
        JAVA_DRIVER
            .replace("__ARGS__", &args.join("\n"))
            .replace("__RETURN__", Self::type_name(entry.returns))
            .replace("__CALL__", &call_list(entry.params.len()))
            .replace("__ENTRY__", &entry.name)
            .replace("__MARKER__", RESULT_MARKER)
    }
}

fn call_list(arity: usize) -> String {
    (0..arity)
        .map(|i| format!("arg{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Last line of `stdout` carrying the result marker, with the marker removed.
pub fn extract_result(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim_end_matches('\r').strip_prefix(RESULT_MARKER))
        .map(str::trim)
}
