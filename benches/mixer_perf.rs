use criterion::{Criterion, criterion_group, criterion_main};
use dsynth::mixer::{Mixer, MixerConfig};
use dsynth::song::LiveEventQueue;

fn bench_render_block(c: &mut Criterion) {
    let mut mixer = Mixer::open(MixerConfig {
        sample_rate: 44_100,
        max_song_voices: 32,
        max_sound_voices: 8,
        mix_level: 1.0,
    });

    let song = mixer.add_song(Box::new(LiveEventQueue::new()));
    if let Some(s) = mixer.song_mut(song) {
        s.start();
        for note in 48..72u8 {
            s.note_on(0, note, 100);
        }
    }

    let mut out = vec![0i16; 512 * 2];
    c.bench_function("render_block_512_frames", |b| {
        b.iter(|| mixer.render_block(&mut out));
    });
}

criterion_group!(benches, bench_render_block);
criterion_main!(benches);
