// Build script to compile GLSL shaders to SPIR-V
//
// Output lands next to the source as `<name>.spv`, which is where the
// renderer looks first. Without glslc the renderer compiles at start-up.

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 2] = ["shaders/triangle.vert", "shaders/triangle.frag"];

fn main() {
    for shader in SHADERS {
        println!("cargo:rerun-if-changed={}", shader);
        compile_shader(Path::new(shader));
    }
}

fn compile_shader(input: &Path) {
    let mut output = input.as_os_str().to_owned();
    output.push(".spv");

    let result = Command::new("glslc").arg(input).arg("-o").arg(&output).status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {:?}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {:?} will be compiled at start-up", e, input);
        }
    }
}
