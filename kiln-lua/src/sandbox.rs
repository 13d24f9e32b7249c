//! Lua sandbox creation
//!
//! Matrix files are plain data plus whatever Lua the author uses to avoid
//! repeating themselves. The sandbox has no filesystem, process or module
//! loading capabilities.

use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table};

/// Create a restricted Lua sandbox with the `matrix` module registered
///
/// Only the table, string and math libraries are loaded. `io`, `os`,
/// `package` and `debug` are absent, and `require`, `dofile` and
/// `loadfile` are removed.
///
/// # Example
/// ```no_run
/// use kiln_lua::sandbox::create_sandbox;
///
/// let lua = create_sandbox()?;
/// let matrix: mlua::Table = lua
///     .load(r#"return matrix.define { targets = {} }"#)
///     .eval()?;
/// # Ok::<(), mlua::Error>(())
/// ```
pub fn create_sandbox() -> LuaResult<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;

    lua.globals().set("require", mlua::Nil)?;
    lua.globals().set("dofile", mlua::Nil)?;
    lua.globals().set("loadfile", mlua::Nil)?;

    register_matrix_module(&lua)?;

    Ok(lua)
}

/// Register the matrix module
///
/// `define`, `target` and `stage` return their argument unchanged; they
/// exist so matrix files read declaratively. `fetch(tag, dest)` builds a
/// precondition entry.
fn register_matrix_module(lua: &Lua) -> LuaResult<()> {
    let matrix = lua.create_table()?;

    let define_fn = lua.create_function(|_, definition: Table| Ok(definition))?;
    matrix.set("define", define_fn)?;

    let target_fn = lua.create_function(|_, target: Table| Ok(target))?;
    matrix.set("target", target_fn)?;

    let stage_fn = lua.create_function(|_, stage: Table| Ok(stage))?;
    matrix.set("stage", stage_fn)?;

    let fetch_fn = lua.create_function(|lua, (tag, dest): (String, Option<String>)| {
        let entry = lua.create_table()?;
        entry.set("dest", dest.unwrap_or_else(|| format!("deps/{}", tag)))?;
        entry.set("tag", tag)?;
        Ok(entry)
    })?;
    matrix.set("fetch", fetch_fn)?;

    lua.globals().set("matrix", matrix)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_basic_lua() {
        let lua = create_sandbox().unwrap();

        let result: String = lua
            .load(r#"return string.format("%s_%dbit", "ubuntu", 64)"#)
            .eval()
            .unwrap();
        assert_eq!(result, "ubuntu_64bit");
    }

    #[test]
    fn test_sandbox_no_io() {
        let lua = create_sandbox().unwrap();

        let has_io: bool = lua.load(r#"return io ~= nil"#).eval().unwrap();
        assert!(!has_io);

        let has_os: bool = lua.load(r#"return os ~= nil"#).eval().unwrap();
        assert!(!has_os);
    }

    #[test]
    fn test_sandbox_no_require() {
        let lua = create_sandbox().unwrap();

        let result: LuaResult<()> = lua.load(r#"require("os")"#).exec();
        assert!(result.is_err());
    }

    #[test]
    fn test_matrix_fetch_defaults_dest() {
        let lua = create_sandbox().unwrap();

        let dest: String = lua
            .load(r#"return matrix.fetch("ubuntu_64bit").dest"#)
            .eval()
            .unwrap();
        assert_eq!(dest, "deps/ubuntu_64bit");

        let dest: String = lua
            .load(r#"return matrix.fetch("centos_64bit", "clients").dest"#)
            .eval()
            .unwrap();
        assert_eq!(dest, "clients");
    }

    #[test]
    fn test_matrix_define_passthrough() {
        let lua = create_sandbox().unwrap();

        let tag: String = lua
            .load(
                r#"
                local t = matrix.target { tag = "osx" }
                return matrix.define({ targets = { t } }).targets[1].tag
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(tag, "osx");
    }
}
