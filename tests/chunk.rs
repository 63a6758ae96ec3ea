//! PNG carriage: embed a module, get the same bytes back.

use pngine::chunk;

fn pseudo_random_bytes(len: usize) -> Vec<u8> {
    // xorshift; fixed seed keeps the test reproducible.
    let mut state = 0x2545f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn embed_extract_is_byte_exact() {
    let png = chunk::tiny_png();
    let blob = pseudo_random_bytes(500);
    let carried = chunk::embed(&png, &blob, false).unwrap();
    assert_eq!(chunk::extract(&carried).unwrap(), blob);
}

#[test]
fn compressed_embed_extract_is_byte_exact() {
    let png = chunk::tiny_png();
    let blob = pseudo_random_bytes(500);
    let carried = chunk::embed(&png, &blob, true).unwrap();
    assert!(chunk::chunk_info(&carried).unwrap().compressed);
    assert_eq!(chunk::extract(&carried).unwrap(), blob);
}

#[test]
fn a_real_module_survives_the_trip() {
    let bytes = pngine::compile_to_bytes(
        r#"
        #wgsl tri { code = "@vertex fn vs() {}" }
        #renderPipeline p { vertex = { module = $wgsl.tri, entryPoint = "vs" } }
        #renderPass draw { colorAttachments = [{}], pipeline = $renderPipeline.p, draw = 3 }
        #frame main { perform = [$renderPass.draw] }
        "#,
    )
    .unwrap();

    let carried = chunk::embed(&chunk::tiny_png(), &bytes, true).unwrap();
    let extracted = chunk::extract(&carried).unwrap();
    assert_eq!(extracted, bytes);
    // And the extracted bytes still decode.
    pngine::Module::decode(&extracted).unwrap();
}

#[test]
fn plain_png_has_no_chunk() {
    let png = chunk::tiny_png();
    assert!(!chunk::has_chunk(&png));
    assert_eq!(chunk::extract(&png), Err(chunk::ChunkError::MissingChunk));
}
