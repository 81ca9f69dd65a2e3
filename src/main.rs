use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use cdmlm_rs::{args::Arguments, context::init_logging, run::run};
use structopt::StructOpt;

fn main() {
    let args = Arguments::from_args();
    // errors raised before the run sets logging up must be reported too
    init_logging(args.training.local_rank);

    let outcome = if args.training.no_cuda {
        run::<Autodiff<NdArray>>(args, NdArrayDevice::Cpu)
    } else {
        run::<Autodiff<Wgpu>>(args, WgpuDevice::BestAvailable)
    };

    if let Err(e) = outcome {
        log::error!("{e}");
        std::process::exit(1);
    }
}
